//! # Tally Common
//!
//! Shared types and errors for the Tally usage rating service.
//!
//! ## Core Types
//!
//! - [`AggregatedUsageDoc`]: aggregated usage tree produced upstream
//! - [`RatedUsageState`]: current cumulative rated state for a state key
//! - [`RatedUsageLogEntry`]: immutable snapshot written per rated document
//! - [`StateKey`]/[`LogKey`]: `k/<org>/t/<day>[/<seq>]` composite keys
//! - [`SequenceGenerator`]: unique, time-ordered sequence tokens

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{Result, TallyError};
pub use types::{
    keys::{checked_utc_day, utc_day, LogKey, StateKey, DAY_MS, EARLIEST_DAY},
    rated::{RatedUsage, RatedUsageLogEntry, RatedUsageState, Revision},
    sequence::SequenceGenerator,
    usage::{
        AggregatedUsageDoc, ConsumerUsage, MetricUsage, PlanUsage, ResourceUsage, SpaceUsage,
    },
};

/// Tally version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pricing country used when an account has none configured
pub const DEFAULT_PRICING_COUNTRY: &str = "USA";
