//! Batch coalescer
//!
//! Concurrent rating requests are queued and flushed as one batch when the
//! batch is full or the flush interval elapses. Each batch is grouped by
//! state key; every group goes through one serialized update and groups run
//! concurrently. Every caller gets its own result through a oneshot channel.

use super::update::GroupUpdate;
use super::RatingRequest;
use crate::metrics::RatingMetrics;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{RatedUsageState, Result, StateKey, TallyError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the batch coalescer
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum requests per batch
    pub max_batch_size: usize,
    /// Flush interval for partially filled batches
    pub flush_interval: Duration,
    /// Request channel buffer size
    pub channel_buffer: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(5),
            channel_buffer: 10000,
        }
    }
}

struct Submission {
    request: RatingRequest,
    reply: oneshot::Sender<Result<RatedUsageState>>,
}

/// Queue of rating requests drained by a background batch processor
#[derive(Clone)]
pub struct BatchCoalescer {
    request_tx: mpsc::Sender<Submission>,
}

impl BatchCoalescer {
    /// Spawn the batch processor on the current runtime
    pub fn spawn(
        config: BatchConfig,
        update: Arc<dyn GroupUpdate>,
        metrics: Arc<RatingMetrics>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(config.channel_buffer.max(1));
        tokio::spawn(Self::batch_processor(config, request_rx, update, metrics));
        Self { request_tx }
    }

    /// Queue a request and wait for the result of its group
    #[instrument(skip(self, request), fields(key = %request.state_key))]
    pub async fn submit(&self, request: RatingRequest) -> Result<RatedUsageState> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(Submission { request, reply })
            .await
            .map_err(|_| TallyError::Internal("Rating queue closed".into()))?;

        response
            .await
            .map_err(|_| TallyError::Internal("Rating batch dropped the request".into()))?
    }

    async fn batch_processor(
        config: BatchConfig,
        mut request_rx: mpsc::Receiver<Submission>,
        update: Arc<dyn GroupUpdate>,
        metrics: Arc<RatingMetrics>,
    ) {
        let max_batch_size = config.max_batch_size.max(1);
        let mut pending: Vec<Submission> = Vec::with_capacity(max_batch_size);
        let flush_interval = config.flush_interval.max(Duration::from_millis(1));
        let mut flush_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);

        loop {
            tokio::select! {
                submission = request_rx.recv() => {
                    match submission {
                        Some(s) => {
                            pending.push(s);
                            if pending.len() >= max_batch_size {
                                Self::dispatch(std::mem::take(&mut pending), &update, &metrics);
                            }
                        }
                        None => {
                            if !pending.is_empty() {
                                Self::dispatch(std::mem::take(&mut pending), &update, &metrics);
                            }
                            info!("Rating queue closed, batch processor exiting");
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    if !pending.is_empty() {
                        Self::dispatch(std::mem::take(&mut pending), &update, &metrics);
                    }
                }
            }
        }
    }

    /// Run a batch off the processor loop so queuing continues meanwhile
    fn dispatch(
        batch: Vec<Submission>,
        update: &Arc<dyn GroupUpdate>,
        metrics: &Arc<RatingMetrics>,
    ) {
        metrics.batch_size.observe(batch.len() as f64);
        let update = update.clone();

        tokio::spawn(async move {
            let (requests, replies): (Vec<_>, Vec<_>) =
                batch.into_iter().map(|s| (s.request, s.reply)).unzip();

            let results = process_batch(update.as_ref(), requests).await;
            for (reply, result) in replies.into_iter().zip(results) {
                if reply.send(result).is_err() {
                    debug!("Rating caller went away before its result");
                }
            }
        });
    }
}

/// Group a batch by state key, apply every group, and return one result per
/// request in submission order.
///
/// A group failure, including a panic while applying it, is handed to every
/// request of that group only.
pub async fn process_batch(
    update: &dyn GroupUpdate,
    requests: Vec<RatingRequest>,
) -> Vec<Result<RatedUsageState>> {
    let total = requests.len();

    let mut group_of: HashMap<StateKey, usize> = HashMap::new();
    let mut groups: Vec<(StateKey, Vec<usize>, Vec<RatingRequest>)> = Vec::new();
    for (index, request) in requests.into_iter().enumerate() {
        let slot = *group_of.entry(request.state_key.clone()).or_insert_with(|| {
            groups.push((request.state_key.clone(), Vec::new(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(index);
        groups[slot].2.push(request);
    }
    debug!(requests = total, groups = groups.len(), "Processing rating batch");

    let outcomes = join_all(groups.iter().map(|(key, _, group)| async move {
        AssertUnwindSafe(update.apply(key, group))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(key = %key, "Group update panicked");
                Err(TallyError::Internal(format!("update of {} panicked", key)))
            })
    }))
    .await;

    let mut results: Vec<Option<Result<RatedUsageState>>> = (0..total).map(|_| None).collect();
    for ((key, indices, _), outcome) in groups.iter().zip(outcomes) {
        match outcome {
            Ok(states) if states.len() == indices.len() => {
                for (&index, state) in indices.iter().zip(states) {
                    results[index] = Some(Ok(state));
                }
            }
            Ok(states) => {
                warn!(
                    key = %key,
                    expected = indices.len(),
                    got = states.len(),
                    "Group returned wrong number of states"
                );
                let err = TallyError::Internal(format!(
                    "group {} returned {} states",
                    key,
                    states.len()
                ));
                for &index in indices {
                    results[index] = Some(Err(err.clone()));
                }
            }
            Err(err) => {
                for &index in indices {
                    results[index] = Some(Err(err.clone()));
                }
            }
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(TallyError::Internal("request lost in batch".into()))))
        .collect()
}
