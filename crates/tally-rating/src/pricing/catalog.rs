//! Resource metric and price configuration
//!
//! Both configurations are supplied externally as JSON in the shape used by
//! the resource and price providers, and indexed here for lookup:
//!
//! ```text
//! metrics: resource_id -> metric -> rate function
//! prices:  resource_id -> plan_id -> metric -> country -> unit price
//! ```

use super::rate_fn::{RateFunction, RateFunctionRegistry, RateSpec};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tally_common::{Result, TallyError};
use tracing::debug;

/// Metric definition of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    #[serde(default)]
    pub rate: RateSpec,
}

/// Metric definitions of one resource, as supplied by the resource provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub resource_id: String,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
}

/// Resource id -> metric definitions
#[derive(Debug, Clone, Default)]
pub struct MetricConfig {
    resources: HashMap<String, Vec<MetricDefinition>>,
}

impl MetricConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: Vec<ResourceMetrics>) -> Self {
        let mut config = Self::new();
        for resource in resources {
            config
                .resources
                .entry(resource.resource_id)
                .or_default()
                .extend(resource.metrics);
        }
        config
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let resources: Vec<ResourceMetrics> = serde_json::from_str(json)?;
        Ok(Self::from_resources(resources))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TallyError::Config(format!(
                "Failed to read metric config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Add a metric definition
    pub fn with_metric(
        mut self,
        resource_id: impl Into<String>,
        metric: impl Into<String>,
        rate: RateSpec,
    ) -> Self {
        self.resources
            .entry(resource_id.into())
            .or_default()
            .push(MetricDefinition {
                name: metric.into(),
                rate,
            });
        self
    }

    pub fn metrics(&self, resource_id: &str) -> &[MetricDefinition] {
        self.resources
            .get(resource_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Price of a metric in one country
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryPrice {
    pub country: String,
    pub price: Decimal,
}

/// Country prices of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPrices {
    pub name: String,
    #[serde(default)]
    pub prices: Vec<CountryPrice>,
}

/// Metric prices of one plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPrices {
    pub plan_id: String,
    #[serde(default)]
    pub metrics: Vec<MetricPrices>,
}

/// Plan prices of one resource, as supplied by the price provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePrices {
    pub resource_id: String,
    #[serde(default)]
    pub plans: Vec<PlanPrices>,
}

type CountryTable = HashMap<String, Decimal>;
type MetricTable = HashMap<String, CountryTable>;
type PlanTable = HashMap<String, MetricTable>;

/// Resource id -> plan id -> metric -> country -> unit price
#[derive(Debug, Clone, Default)]
pub struct PriceConfig {
    resources: HashMap<String, PlanTable>,
}

impl PriceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: Vec<ResourcePrices>) -> Self {
        let mut config = Self::new();
        for resource in resources {
            for plan in resource.plans {
                for metric in plan.metrics {
                    for price in metric.prices {
                        config = config.with_price(
                            resource.resource_id.clone(),
                            plan.plan_id.clone(),
                            metric.name.clone(),
                            price.country,
                            price.price,
                        );
                    }
                }
            }
        }
        config
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let resources: Vec<ResourcePrices> = serde_json::from_str(json)?;
        Ok(Self::from_resources(resources))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TallyError::Config(format!(
                "Failed to read price config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Set the unit price of a metric in a country
    pub fn with_price(
        mut self,
        resource_id: impl Into<String>,
        plan_id: impl Into<String>,
        metric: impl Into<String>,
        country: impl Into<String>,
        price: Decimal,
    ) -> Self {
        self.resources
            .entry(resource_id.into())
            .or_default()
            .entry(plan_id.into())
            .or_default()
            .entry(metric.into())
            .or_default()
            .insert(country.into(), price);
        self
    }

    /// Unit price, zero when any level of the hierarchy is missing
    pub fn price(&self, resource_id: &str, plan_id: &str, metric: &str, country: &str) -> Decimal {
        self.resources
            .get(resource_id)
            .and_then(|plans| plans.get(plan_id))
            .and_then(|metrics| metrics.get(metric))
            .and_then(|countries| countries.get(country))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

/// Resolved pricing configuration: prices plus built rate functions
pub struct PricingCatalog {
    rate_functions: HashMap<String, HashMap<String, Arc<dyn RateFunction>>>,
    prices: PriceConfig,
}

impl PricingCatalog {
    /// Build every configured rate function up front
    pub fn new(
        metrics: &MetricConfig,
        prices: PriceConfig,
        registry: &RateFunctionRegistry,
    ) -> Result<Self> {
        let mut rate_functions: HashMap<String, HashMap<String, Arc<dyn RateFunction>>> =
            HashMap::new();
        for (resource_id, definitions) in &metrics.resources {
            let by_metric = rate_functions.entry(resource_id.clone()).or_default();
            for definition in definitions {
                by_metric.insert(definition.name.clone(), registry.build(&definition.rate)?);
            }
        }
        debug!(resources = rate_functions.len(), "Built pricing catalog");

        Ok(Self {
            rate_functions,
            prices,
        })
    }

    /// Unit price of a metric; never fails, missing configuration prices at zero
    pub fn resolve_price(
        &self,
        resource_id: &str,
        plan_id: &str,
        metric: &str,
        country: &str,
    ) -> Decimal {
        self.prices.price(resource_id, plan_id, metric, country)
    }

    /// Rate function of a metric; a metric without one is a configuration defect
    pub fn resolve_rate_function(
        &self,
        resource_id: &str,
        metric: &str,
    ) -> Result<Arc<dyn RateFunction>> {
        self.rate_functions
            .get(resource_id)
            .and_then(|metrics| metrics.get(metric))
            .cloned()
            .ok_or_else(|| TallyError::ConfigMissing {
                resource_id: resource_id.to_string(),
                metric: metric.to_string(),
            })
    }
}
