//! # Tally Rating
//!
//! Rates aggregated usage documents against configured prices and keeps a
//! running rated total per organization per UTC day.
//!
//! ## Flow
//!
//! ```text
//! POST usage -> key derivation -> batch coalescer -> group by state key
//!   -> key lock -> read state -> fold rating engine -> write state
//!   -> append one log entry per document
//! ```
//!
//! Concurrent documents for the same organization and day are folded in
//! one serialized update with a single durable write.

pub mod batch;
pub mod config;
pub mod http;
pub mod lock;
pub mod metrics;
pub mod pricing;
pub mod rating;
pub mod resilience;
pub mod service;
pub mod store;

pub use config::RatingConfig;
pub use pricing::{MetricConfig, PriceConfig, PricingCatalog, RateFunctionRegistry};
pub use rating::RatingEngine;
pub use service::{Backends, RatingService};
