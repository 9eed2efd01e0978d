//! Rating orchestrator
//!
//! Derives keys, sends each document through the batch coalescer, then
//! appends one rating log entry per document.

use crate::batch::{BatchCoalescer, RatingRequest, SerializedUpdate};
use crate::config::RatingConfig;
use crate::lock::KeyLockManager;
use crate::metrics::RatingMetrics;
use crate::pricing::{AccountDirectory, PricingCatalog, PricingResolver};
use crate::resilience::Resilience;
use crate::store::{LogStore, RatedStateAdapter, RatingLog, StateCache, StateStore};
use std::sync::Arc;
use tally_common::{
    AggregatedUsageDoc, LogKey, RatedUsageLogEntry, Result, SequenceGenerator, TallyError,
};
use tracing::{error, info, instrument};

/// Collaborators the service is assembled from
#[derive(Clone)]
pub struct Backends {
    pub accounts: Arc<dyn AccountDirectory>,
    pub state_store: Arc<dyn StateStore>,
    pub cache: Arc<dyn StateCache>,
    pub log_store: Arc<dyn LogStore>,
}

/// Rating service
pub struct RatingService {
    coalescer: BatchCoalescer,
    log: Arc<RatingLog>,
    sequence: SequenceGenerator,
    metrics: Arc<RatingMetrics>,
}

impl RatingService {
    /// Wire the service and spawn its batch processor on the current runtime
    pub fn new(
        config: &RatingConfig,
        catalog: Arc<PricingCatalog>,
        backends: Backends,
    ) -> Result<Self> {
        let retry = config.retry.to_retry_config();
        let circuit = config.circuit.to_circuit_config();
        let guard = |service: &str| Resilience::new(service, retry.clone(), circuit.clone());

        let metrics = Arc::new(RatingMetrics::new()?);
        let pricing = Arc::new(
            PricingResolver::new(backends.accounts, catalog, guard("account-service"))
                .with_fallback_country(config.account.fallback_country.clone()),
        );
        let states = Arc::new(RatedStateAdapter::new(
            backends.state_store,
            backends.cache,
            guard("state-store"),
            guard("state-cache"),
        ));
        let log = Arc::new(RatingLog::new(backends.log_store, guard("log-store")));

        let update = Arc::new(SerializedUpdate::new(
            KeyLockManager::new(config.lock.timeout()),
            states,
            pricing,
            metrics.clone(),
        ));
        let coalescer =
            BatchCoalescer::spawn(config.batch.to_batch_config(), update, metrics.clone());

        info!(
            max_batch_size = config.batch.max_batch_size,
            lock_timeout_ms = config.lock.timeout_ms,
            "Rating service initialized"
        );

        Ok(Self {
            coalescer,
            log,
            sequence: SequenceGenerator::new(),
            metrics,
        })
    }

    /// Rate one aggregated usage document, returning the key of its log entry
    #[instrument(skip(self, usage), fields(organization_id = %usage.organization_id))]
    pub async fn rate_usage(&self, usage: AggregatedUsageDoc) -> Result<LogKey> {
        if let Err(e) = usage.validate() {
            self.metrics.record_failure(&e);
            return Err(e);
        }

        let request = RatingRequest::new(usage, self.sequence.next_token());
        let log_key = request.log_key.clone();
        let aggregated_usage_id = request.usage.id.clone();

        let state = self.coalescer.submit(request).await?;

        let entry = RatedUsageLogEntry::snapshot(log_key.to_string(), &state, aggregated_usage_id);
        if let Err(e) = self.log.append(&log_key, &entry).await {
            self.metrics.log_append_failures.inc();
            error!(
                key = %log_key,
                error = %e,
                "Rated state persisted but its log entry could not be appended"
            );
            return Err(e);
        }

        Ok(log_key)
    }

    /// Read a rating log entry without its storage bookkeeping
    #[instrument(skip(self))]
    pub async fn get_rated_usage(
        &self,
        organization_id: &str,
        day: &str,
        sequence: &str,
    ) -> Result<RatedUsageLogEntry> {
        let key = LogKey::from_parts(organization_id, day, sequence)?;

        self.log
            .get(&key)
            .await?
            .map(RatedUsageLogEntry::redacted)
            .ok_or_else(|| TallyError::NotFound(format!("rated usage {}", key)))
    }

    pub fn metrics(&self) -> &Arc<RatingMetrics> {
        &self.metrics
    }
}
