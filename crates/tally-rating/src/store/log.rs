use super::LogStore;
use crate::resilience::Resilience;
use std::sync::Arc;
use tally_common::{LogKey, RatedUsageLogEntry, Result};
use tracing::{debug, instrument};

/// Append-only rating log
pub struct RatingLog {
    store: Arc<dyn LogStore>,
    guard: Resilience,
}

impl RatingLog {
    pub fn new(store: Arc<dyn LogStore>, guard: Resilience) -> Self {
        Self { store, guard }
    }

    /// Append an entry under a fresh log key
    #[instrument(skip(self, entry), fields(key = %key))]
    pub async fn append(&self, key: &LogKey, entry: &RatedUsageLogEntry) -> Result<()> {
        let revision = self
            .guard
            .call("log_put", || self.store.put(key, entry))
            .await?;
        debug!(%revision, "Rating log entry appended");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &LogKey) -> Result<Option<RatedUsageLogEntry>> {
        self.guard.call("log_get", || self.store.get(key)).await
    }
}
