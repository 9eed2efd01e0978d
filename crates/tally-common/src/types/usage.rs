//! Aggregated usage documents
//!
//! The usage tree produced by the aggregation stage. Usage is reported at
//! three scopes, each holding the same resource -> plan -> metric shape:
//!
//! ```text
//! resources[]
//! spaces[].resources[]
//! spaces[].consumers[].resources[]
//! ```
//!
//! Rated documents reuse the same tree, with `cost` filled in on every metric.
//! Fields this service does not interpret are kept in `extra` and carried
//! through rating unchanged.

use super::keys::checked_utc_day;
use crate::error::{Result, TallyError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single metric entry under a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUsage {
    /// Metric name (e.g. "memory", "api_calls")
    pub metric: String,
    /// Aggregated quantity for the period
    pub quantity: Decimal,
    /// Computed cost, present once the entry has been rated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Decimal>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricUsage {
    pub fn new(metric: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            metric: metric.into(),
            quantity,
            cost: None,
            extra: Map::new(),
        }
    }
}

/// Usage of one plan of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUsage {
    pub plan_id: String,
    #[serde(default)]
    pub aggregated_usage: Vec<MetricUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanUsage {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            aggregated_usage: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Add a metric entry
    pub fn with_metric(mut self, metric: impl Into<String>, quantity: Decimal) -> Self {
        self.aggregated_usage.push(MetricUsage::new(metric, quantity));
        self
    }

    pub fn metric(&self, name: &str) -> Option<&MetricUsage> {
        self.aggregated_usage.iter().find(|m| m.metric == name)
    }
}

/// Usage of one resource, broken down by plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource_id: String,
    #[serde(default)]
    pub plans: Vec<PlanUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceUsage {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            plans: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_plan(mut self, plan: PlanUsage) -> Self {
        self.plans.push(plan);
        self
    }

    /// Find a metric entry by plan and metric name
    pub fn metric(&self, plan_id: &str, metric: &str) -> Option<&MetricUsage> {
        self.plans
            .iter()
            .find(|p| p.plan_id == plan_id)
            .and_then(|p| p.metric(metric))
    }
}

/// Usage of a consumer (application) within a space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerUsage {
    pub consumer_id: String,
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConsumerUsage {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            resources: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_resource(mut self, resource: ResourceUsage) -> Self {
        self.resources.push(resource);
        self
    }
}

/// Usage of a space, with its own resources and per-consumer resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub space_id: String,
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    #[serde(default)]
    pub consumers: Vec<ConsumerUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SpaceUsage {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            resources: Vec::new(),
            consumers: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_resource(mut self, resource: ResourceUsage) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerUsage) -> Self {
        self.consumers.push(consumer);
        self
    }
}

/// Aggregated usage for an organization over a period, as produced upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUsageDoc {
    /// Id of the aggregated usage document, referenced by rating log entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub organization_id: String,
    /// Period start (Unix millis)
    pub start: i64,
    /// Period end (Unix millis)
    pub end: i64,
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    #[serde(default)]
    pub spaces: Vec<SpaceUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AggregatedUsageDoc {
    /// Create an empty usage document for an organization and period
    pub fn new(organization_id: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            id: None,
            organization_id: organization_id.into(),
            start,
            end,
            resources: Vec::new(),
            spaces: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Set the document id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_resource(mut self, resource: ResourceUsage) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_space(mut self, space: SpaceUsage) -> Self {
        self.spaces.push(space);
        self
    }

    /// Reject documents that cannot be keyed or rated
    pub fn validate(&self) -> Result<()> {
        if self.organization_id.is_empty() {
            return Err(TallyError::Validation("organization_id is required".into()));
        }
        if self.organization_id.contains('/') {
            return Err(TallyError::Validation(
                "organization_id must not contain '/'".into(),
            ));
        }
        if self.end < self.start {
            return Err(TallyError::Validation(format!(
                "period end {} precedes start {}",
                self.end, self.start
            )));
        }
        if checked_utc_day(self.end).is_none() {
            return Err(TallyError::Validation(format!(
                "period end {} is out of range",
                self.end
            )));
        }

        let space_resources = self.spaces.iter().flat_map(|s| {
            s.resources
                .iter()
                .chain(s.consumers.iter().flat_map(|c| c.resources.iter()))
        });
        for resource in self.resources.iter().chain(space_resources) {
            if resource.resource_id.is_empty() {
                return Err(TallyError::Validation("resource_id is required".into()));
            }
            for plan in &resource.plans {
                if plan.aggregated_usage.iter().any(|m| m.metric.is_empty()) {
                    return Err(TallyError::Validation(format!(
                        "metric name is required under {}/{}",
                        resource.resource_id, plan.plan_id
                    )));
                }
            }
        }
        Ok(())
    }
}
