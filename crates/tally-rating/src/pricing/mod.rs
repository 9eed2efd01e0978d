//! Pricing resolution
//!
//! Resolves, per organization, the billing country and, per
//! resource/plan/metric, the unit price and rate function used by the rating
//! engine.

mod account;
mod catalog;
mod rate_fn;
mod resolver;

pub use account::{AccountDirectory, HttpAccountDirectory, StaticAccountDirectory};
pub use catalog::{
    CountryPrice, MetricConfig, MetricDefinition, MetricPrices, PlanPrices, PriceConfig,
    PricingCatalog, ResourceMetrics, ResourcePrices,
};
pub use rate_fn::{Flat, Linear, RateFunction, RateFunctionRegistry, RateSpec, Tier, Tiered};
pub use resolver::PricingResolver;
