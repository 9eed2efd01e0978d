//! Prometheus metrics for the rating service

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tally_common::{Result, TallyError};

fn metric_error(e: prometheus::Error) -> TallyError {
    TallyError::Internal(format!("Metrics error: {}", e))
}

/// Rating counters and histograms, registered on their own registry
pub struct RatingMetrics {
    registry: Registry,
    pub rated_documents: IntCounter,
    pub rating_failures: IntCounterVec,
    pub log_append_failures: IntCounter,
    pub group_size: Histogram,
    pub batch_size: Histogram,
}

impl RatingMetrics {
    pub fn new() -> Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            rated_documents: IntCounter::new(
                "tally_rated_documents_total",
                "Usage documents rated and persisted",
            )
            .map_err(metric_error)?,
            rating_failures: IntCounterVec::new(
                Opts::new("tally_rating_failures_total", "Rating failures by error kind"),
                &["kind"],
            )
            .map_err(metric_error)?,
            log_append_failures: IntCounter::new(
                "tally_log_append_failures_total",
                "Rating log entries that could not be appended",
            )
            .map_err(metric_error)?,
            group_size: Histogram::with_opts(
                HistogramOpts::new(
                    "tally_rating_group_size",
                    "Documents folded per state key update",
                )
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
            )
            .map_err(metric_error)?,
            batch_size: Histogram::with_opts(
                HistogramOpts::new("tally_rating_batch_size", "Requests per coalesced batch")
                    .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]),
            )
            .map_err(metric_error)?,
        };
        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> Result<()> {
        self.registry
            .register(Box::new(self.rated_documents.clone()))
            .map_err(metric_error)?;
        self.registry
            .register(Box::new(self.rating_failures.clone()))
            .map_err(metric_error)?;
        self.registry
            .register(Box::new(self.log_append_failures.clone()))
            .map_err(metric_error)?;
        self.registry
            .register(Box::new(self.group_size.clone()))
            .map_err(metric_error)?;
        self.registry
            .register(Box::new(self.batch_size.clone()))
            .map_err(metric_error)?;
        Ok(())
    }

    pub fn record_failure(&self, error: &TallyError) {
        self.rating_failures.with_label_values(&[error.kind()]).inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| TallyError::Internal(e.to_string()))
    }
}
