//! Serialized update of one state key
//!
//! ```text
//! Idle -> Locked -> Loaded -> Folded -> Persisted -> Released
//! ```
//!
//! The lock is released on every exit path; a failure in any phase fails the
//! whole group without persisting anything.

use super::RatingRequest;
use crate::lock::KeyLockManager;
use crate::metrics::RatingMetrics;
use crate::pricing::PricingResolver;
use crate::rating::RatingEngine;
use crate::store::RatedStateAdapter;
use async_trait::async_trait;
use std::sync::Arc;
use tally_common::{RatedUsageState, Result, StateKey, TallyError};
use tracing::{debug, instrument, warn};

/// Phases of a serialized update, for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Locked,
    Loaded,
    Folded,
    Persisted,
    Released,
}

/// Applies a group of same-key requests as one update
#[async_trait]
pub trait GroupUpdate: Send + Sync {
    /// Fold `requests` in order into the state of `key`, returning the state
    /// after each request
    async fn apply(&self, key: &StateKey, requests: &[RatingRequest])
        -> Result<Vec<RatedUsageState>>;
}

/// Lock, load, fold, persist, release
pub struct SerializedUpdate {
    locks: KeyLockManager,
    states: Arc<RatedStateAdapter>,
    pricing: Arc<PricingResolver>,
    engine: RatingEngine,
    metrics: Arc<RatingMetrics>,
}

impl SerializedUpdate {
    pub fn new(
        locks: KeyLockManager,
        states: Arc<RatedStateAdapter>,
        pricing: Arc<PricingResolver>,
        metrics: Arc<RatingMetrics>,
    ) -> Self {
        let engine = RatingEngine::new(pricing.catalog().clone());
        Self {
            locks,
            states,
            pricing,
            engine,
            metrics,
        }
    }

    async fn locked_update(
        &self,
        key: &StateKey,
        requests: &[RatingRequest],
    ) -> Result<Vec<RatedUsageState>> {
        let (first, last) = match (requests.first(), requests.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(Vec::new()),
        };

        let previous = self.states.get(key).await?;
        let country = self
            .pricing
            .resolve_country(&first.usage.organization_id)
            .await?;
        debug!(phase = ?UpdatePhase::Loaded, %country, existing = previous.is_some());

        // The back-reference is rewritten for every persisted state
        let start = previous.map(|mut state| {
            state.last_rated_usage_id = None;
            state
        });
        let states = self
            .engine
            .fold(start, requests.iter().map(|r| &r.usage), &country)?;
        debug!(phase = ?UpdatePhase::Folded, folded = states.len());

        let mut last_state = states
            .last()
            .cloned()
            .ok_or_else(|| TallyError::Internal("fold produced no state".into()))?;
        last_state.id = Some(key.to_string());
        last_state.last_rated_usage_id = Some(last.log_key.to_string());
        last_state.aggregated_usage_id = last.usage.id.clone();

        let written = self.states.put(key, last_state).await?;
        debug!(phase = ?UpdatePhase::Persisted, revision = ?written.revision);

        Ok(states)
    }
}

#[async_trait]
impl GroupUpdate for SerializedUpdate {
    #[instrument(skip(self, requests), fields(key = %key, group_size = requests.len()))]
    async fn apply(
        &self,
        key: &StateKey,
        requests: &[RatingRequest],
    ) -> Result<Vec<RatedUsageState>> {
        self.metrics.group_size.observe(requests.len() as f64);

        let mut lock = self.locks.acquire(key).await.map_err(|e| {
            self.metrics.record_failure(&e);
            e
        })?;
        debug!(phase = ?UpdatePhase::Locked);

        let result = self.locked_update(key, requests).await;
        lock.release();
        debug!(phase = ?UpdatePhase::Released);

        match &result {
            Ok(_) => self.metrics.rated_documents.inc_by(requests.len() as u64),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Group update failed");
                self.metrics.record_failure(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{
        MetricConfig, PriceConfig, PricingCatalog, RateFunctionRegistry, RateSpec,
        StaticAccountDirectory,
    };
    use crate::resilience::{CircuitConfig, Resilience, RetryConfig};
    use crate::store::{MemoryStateCache, MemoryStateStore, StateStore};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tally_common::{AggregatedUsageDoc, PlanUsage, ResourceUsage, Revision};

    struct Fixture {
        store: Arc<MemoryStateStore>,
        cache: Arc<MemoryStateCache>,
        locks: KeyLockManager,
        update: SerializedUpdate,
    }

    fn fixture() -> Fixture {
        let guard = |name| Resilience::new(name, RetryConfig::quick(), CircuitConfig::default());
        let store = Arc::new(MemoryStateStore::new());
        let cache = Arc::new(MemoryStateCache::new());
        let states = Arc::new(RatedStateAdapter::new(
            store.clone(),
            cache.clone(),
            guard("state-store"),
            guard("cache"),
        ));
        let catalog = PricingCatalog::new(
            &MetricConfig::new().with_metric("test-resource", "memory", RateSpec::Linear),
            PriceConfig::new().with_price("test-resource", "basic", "memory", "USA", dec!(0.5)),
            &RateFunctionRegistry::new(),
        )
        .unwrap();
        let pricing = Arc::new(PricingResolver::new(
            Arc::new(StaticAccountDirectory::new()),
            Arc::new(catalog),
            guard("accounts"),
        ));
        let locks = KeyLockManager::new(Duration::from_millis(50));
        let update = SerializedUpdate::new(
            locks.clone(),
            states,
            pricing,
            Arc::new(RatingMetrics::new().unwrap()),
        );
        Fixture {
            store,
            cache,
            locks,
            update,
        }
    }

    fn request(seq: &str, metric: &str, quantity: rust_decimal::Decimal) -> RatingRequest {
        let usage = AggregatedUsageDoc::new("org1", 0, 1_000)
            .with_id(format!("usage-{}", seq))
            .with_resource(
                ResourceUsage::new("test-resource")
                    .with_plan(PlanUsage::new("basic").with_metric(metric, quantity)),
            );
        RatingRequest::new(usage, seq)
    }

    #[tokio::test]
    async fn test_group_is_folded_and_persisted_once() {
        let f = fixture();
        let requests = vec![
            request("s1", "memory", dec!(10)),
            request("s2", "memory", dec!(4)),
        ];
        let key = requests[0].state_key.clone();

        let states = f.update.apply(&key, &requests).await.unwrap();
        assert_eq!(states.len(), 2);
        let cost = |s: &RatedUsageState| s.usage.resources[0].metric("basic", "memory").unwrap().cost;
        assert_eq!(cost(&states[0]), Some(dec!(5.0)));
        assert_eq!(cost(&states[1]), Some(dec!(2.0)));

        assert_eq!(f.store.put_count(), 1);
        assert_eq!(f.cache.put_count(), 1);
        assert_eq!(f.locks.active_keys(), 0);

        let (stored, revision) = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(revision, Revision::INITIAL);
        assert_eq!(stored.id, Some(key.to_string()));
        assert_eq!(
            stored.last_rated_usage_id,
            Some(requests[1].log_key.to_string())
        );
        assert_eq!(stored.aggregated_usage_id.as_deref(), Some("usage-s2"));
    }

    #[tokio::test]
    async fn test_next_group_advances_revision() {
        let f = fixture();
        let first = vec![request("s1", "memory", dec!(10))];
        let key = first[0].state_key.clone();
        f.update.apply(&key, &first).await.unwrap();

        let states = f
            .update
            .apply(&key, &[request("s2", "memory", dec!(4))])
            .await
            .unwrap();
        // Intermediate states carry the revision they were read at
        assert_eq!(states[0].revision, Some(Revision::INITIAL));
        assert_eq!(states[0].last_rated_usage_id, None);

        let (_, revision) = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(revision, Revision(1));
    }

    #[tokio::test]
    async fn test_config_error_persists_nothing_and_releases() {
        let f = fixture();
        let requests = vec![
            request("s1", "memory", dec!(10)),
            request("s2", "bandwidth", dec!(4)),
        ];
        let key = requests[0].state_key.clone();

        let err = f.update.apply(&key, &requests).await.unwrap_err();
        assert!(matches!(err, TallyError::ConfigMissing { .. }));
        assert_eq!(f.store.put_count(), 0);
        assert_eq!(f.cache.put_count(), 0);
        assert_eq!(f.locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_times_out_group() {
        let f = fixture();
        let requests = vec![request("s1", "memory", dec!(10))];
        let key = requests[0].state_key.clone();
        let _held = f.locks.acquire(&key).await.unwrap();

        let err = f.update.apply(&key, &requests).await.unwrap_err();
        assert!(matches!(err, TallyError::LockTimeout { .. }));
        assert_eq!(f.store.put_count(), 0);
    }
}
