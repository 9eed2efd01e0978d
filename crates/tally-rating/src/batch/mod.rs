//! Request batching and serialized per-key updates

mod coalescer;
mod update;

pub use coalescer::{process_batch, BatchCoalescer, BatchConfig};
pub use update::{GroupUpdate, SerializedUpdate, UpdatePhase};

use tally_common::{AggregatedUsageDoc, LogKey, StateKey};

/// One usage document to rate, with its derived keys
#[derive(Debug, Clone)]
pub struct RatingRequest {
    pub state_key: StateKey,
    pub log_key: LogKey,
    pub usage: AggregatedUsageDoc,
}

impl RatingRequest {
    /// Derive the state key from the usage period end and the log key from
    /// it plus a sequence token
    pub fn new(usage: AggregatedUsageDoc, sequence: impl Into<String>) -> Self {
        let state_key = StateKey::for_usage(&usage);
        let log_key = state_key.log_key(sequence);
        Self {
            state_key,
            log_key,
            usage,
        }
    }
}
