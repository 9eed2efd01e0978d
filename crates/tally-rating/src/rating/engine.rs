//! Rating engine
//!
//! Pure transformation from an aggregated usage document to a cost-annotated
//! rated state. No I/O: prices and rate functions come from a pre-built
//! [`PricingCatalog`] and the billing country is supplied by the caller.

use crate::pricing::PricingCatalog;
use std::sync::Arc;
use tally_common::{
    AggregatedUsageDoc, ConsumerUsage, PlanUsage, RatedUsageState, ResourceUsage, Result,
    SpaceUsage, TallyError,
};
use tracing::trace;

/// Deterministic rating of usage trees
#[derive(Clone)]
pub struct RatingEngine {
    catalog: Arc<PricingCatalog>,
}

impl RatingEngine {
    pub fn new(catalog: Arc<PricingCatalog>) -> Self {
        Self { catalog }
    }

    /// Rate one usage document on top of the previous state.
    ///
    /// The result is the next value of the same logical document: identity,
    /// revisions and bookkeeping of `previous` are carried over while the
    /// usage trees are replaced by the rated trees of `usage`. Without a
    /// previous state the organization and period come from `usage`.
    pub fn rate(
        &self,
        previous: Option<&RatedUsageState>,
        usage: &AggregatedUsageDoc,
        country: &str,
    ) -> Result<RatedUsageState> {
        let resources = self.rate_resources(&usage.resources, country)?;
        let spaces = usage
            .spaces
            .iter()
            .map(|space| self.rate_space(space, country))
            .collect::<Result<Vec<_>>>()?;

        let mut next = match previous {
            Some(previous) => previous.clone(),
            None => RatedUsageState::seed(usage),
        };
        next.usage.resources = resources;
        next.usage.spaces = spaces;
        Ok(next)
    }

    /// Fold documents in order, returning the state after each one
    pub fn fold<'a, I>(
        &self,
        start: Option<RatedUsageState>,
        docs: I,
        country: &str,
    ) -> Result<Vec<RatedUsageState>>
    where
        I: IntoIterator<Item = &'a AggregatedUsageDoc>,
    {
        let mut states: Vec<RatedUsageState> = Vec::new();
        for doc in docs {
            let previous = states.last().or(start.as_ref());
            let next = self.rate(previous, doc, country)?;
            states.push(next);
        }
        Ok(states)
    }

    fn rate_space(&self, space: &SpaceUsage, country: &str) -> Result<SpaceUsage> {
        let consumers = space
            .consumers
            .iter()
            .map(|consumer| {
                Ok(ConsumerUsage {
                    resources: self.rate_resources(&consumer.resources, country)?,
                    ..consumer.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SpaceUsage {
            resources: self.rate_resources(&space.resources, country)?,
            consumers,
            ..space.clone()
        })
    }

    fn rate_resources(
        &self,
        resources: &[ResourceUsage],
        country: &str,
    ) -> Result<Vec<ResourceUsage>> {
        resources
            .iter()
            .map(|resource| {
                let plans = resource
                    .plans
                    .iter()
                    .map(|plan| self.rate_plan(&resource.resource_id, plan, country))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ResourceUsage {
                    plans,
                    ..resource.clone()
                })
            })
            .collect()
    }

    fn rate_plan(&self, resource_id: &str, plan: &PlanUsage, country: &str) -> Result<PlanUsage> {
        let mut rated = plan.clone();
        for entry in &mut rated.aggregated_usage {
            let rate_fn = self.catalog.resolve_rate_function(resource_id, &entry.metric)?;
            let price =
                self.catalog
                    .resolve_price(resource_id, &plan.plan_id, &entry.metric, country);
            let cost = rate_fn.rate(price, entry.quantity).map_err(|e| match e {
                TallyError::Validation(reason) => TallyError::Validation(format!(
                    "{}/{}/{}: {}",
                    resource_id, plan.plan_id, entry.metric, reason
                )),
                other => other,
            })?;
            trace!(
                resource_id,
                plan_id = %plan.plan_id,
                metric = %entry.metric,
                %price,
                %cost,
                "Rated metric"
            );
            entry.cost = Some(cost);
        }
        Ok(rated)
    }
}
