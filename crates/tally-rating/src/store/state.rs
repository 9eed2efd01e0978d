use super::{StateCache, StateStore};
use crate::resilience::Resilience;
use std::sync::Arc;
use tally_common::{RatedUsageState, Result, Revision, StateKey, TallyError};
use tracing::{debug, error, instrument, warn};

/// Cache-aside access to the current rated state.
///
/// Reads try the cache, then the durable store; a durable hit does not
/// populate the cache. Writes go to the durable store first, then are
/// mirrored to the cache. The cache is best effort: its failures are logged
/// and never fail the caller.
pub struct RatedStateAdapter {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn StateCache>,
    store_guard: Resilience,
    cache_guard: Resilience,
}

impl RatedStateAdapter {
    pub fn new(
        store: Arc<dyn StateStore>,
        cache: Arc<dyn StateCache>,
        store_guard: Resilience,
        cache_guard: Resilience,
    ) -> Self {
        Self {
            store,
            cache,
            store_guard,
            cache_guard,
        }
    }

    /// Current state of a key
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &StateKey) -> Result<Option<RatedUsageState>> {
        match self.cache_guard.call("cache_get", || self.cache.get(key)).await {
            Ok(Some(state)) => {
                debug!("State read from cache");
                return Ok(Some(state));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Cache read failed, falling back to store"),
        }

        let stored = self
            .store_guard
            .call("state_get", || self.store.get(key))
            .await?;

        Ok(stored.map(|(mut state, revision)| {
            debug!(%revision, "State read from store");
            state.revision = Some(revision);
            state
        }))
    }

    /// Persist a new state, expecting the revision it was read at.
    ///
    /// Returns the state as written, carrying its new durable and cache
    /// revisions.
    #[instrument(skip(self, state), fields(key = %key))]
    pub async fn put(&self, key: &StateKey, state: RatedUsageState) -> Result<RatedUsageState> {
        let expected = state.revision;

        let revision = match self
            .store_guard
            .call("state_put", || self.store.put(key, &state, expected))
            .await
        {
            Ok(revision) => revision,
            Err(e @ TallyError::ConcurrentRevisionConflict { .. }) => {
                error!(
                    expected = ?expected,
                    error = %e,
                    "Rated state revision conflict under key lock"
                );
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut written = state;
        written.revision = Some(revision);
        written.cache_revision = Some(written.cache_revision.map_or(Revision::INITIAL, Revision::next));

        if let Err(e) = self
            .cache_guard
            .call("cache_put", || self.cache.put(key, &written))
            .await
        {
            warn!(error = %e, "Cache write failed, evicting stale entry");
            if let Err(e) = self.cache.remove(key).await {
                warn!(error = %e, "Cache eviction failed");
            }
        }

        debug!(%revision, "Rated state persisted");
        Ok(written)
    }
}
