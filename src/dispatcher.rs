use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::client::{Deliver, HttpDeliveryClient};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::storage::{ConfigStore, QueueStore};
use crate::types::DispatchSummary;
use crate::worker::{process_intent, RecordOutcome, WorkerContext};

/// Turns due delivery intents into signed HTTP notifications.
///
/// Holds no state between runs; everything lives in the queue store.
/// Call [`Dispatcher::run_once`] from a timer or an on-demand trigger.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    config: DispatcherConfig,
    run_lock: Mutex<()>,
}

impl Dispatcher {
    /// The claim lease is raised to cover `request_timeout` if needed; see
    /// [`DispatcherConfig::effective_claim_lease`].
    pub fn new(
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn ConfigStore>,
        client: Arc<dyn Deliver>,
        config: DispatcherConfig,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            queue,
            configs,
            client,
            signature_header: config.signature_header.clone(),
            claim_lease: config.effective_claim_lease(),
            backoff: config.backoff,
        });

        Self {
            ctx,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Dispatcher delivering over HTTP with a client built from `config`.
    pub fn with_http_client(
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn ConfigStore>,
        config: DispatcherConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = Arc::new(HttpDeliveryClient::from_config(&config)?);
        Ok(Self::new(queue, configs, client, config))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Process one batch of due records.
    ///
    /// Per-record failures are recorded on the records and counted in the
    /// summary. A store error stops new records from starting, lets the
    /// in-flight ones finish, and is then returned.
    pub async fn run_once(&self) -> Result<DispatchSummary, DispatchError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| DispatchError::AlreadyRunning)?;

        let started_at = Instant::now();
        let deadline = self.config.run_deadline.map(|d| started_at + d);

        let batch = match self.ctx.queue.fetch_due(self.config.batch_limit).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "failed to fetch due deliveries");
                return Err(err.into());
            }
        };

        let total = batch.len();
        info!(
            due = total,
            batch_limit = self.config.batch_limit,
            concurrency = self.config.concurrency(),
            "dispatch run starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency()));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut started = 0usize;

        for intent in batch {
            if aborted.load(Ordering::SeqCst) {
                break;
            }

            let Some(permit) = acquire_permit(&semaphore, deadline).await else {
                break;
            };

            // A worker may have failed while we waited for the permit.
            if aborted.load(Ordering::SeqCst) {
                break;
            }

            let ctx = self.ctx.clone();
            let aborted = aborted.clone();
            tasks.spawn(async move {
                let result = process_intent(&ctx, intent).await;
                if result.is_err() {
                    aborted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                result
            });
            started += 1;
        }

        let not_started = total - started;
        if not_started > 0 && !aborted.load(Ordering::SeqCst) {
            warn!(not_started, "run deadline reached, leaving records for the next run");
        }

        let mut summary = DispatchSummary::default();
        let mut failure: Option<DispatchError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => tally(&mut summary, outcome),
                Ok(Err(err)) => {
                    error!(error = %err, "queue store failed while persisting a delivery");
                    if failure.is_none() {
                        failure = Some(DispatchError::Store(err));
                    }
                }
                Err(err) => {
                    error!(error = %err, "delivery worker task failed");
                    if failure.is_none() {
                        failure = Some(DispatchError::Worker(err.to_string()));
                    }
                }
            }
        }

        summary.skipped += not_started;

        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            processed = summary.processed,
            success_count = summary.success_count,
            error_count = summary.error_count,
            skipped = summary.skipped,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "dispatch run completed"
        );

        Ok(summary)
    }
}

async fn acquire_permit(
    semaphore: &Arc<Semaphore>,
    deadline: Option<Instant>,
) -> Option<OwnedSemaphorePermit> {
    let acquire = semaphore.clone().acquire_owned();
    match deadline {
        Some(deadline) => {
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::timeout_at(deadline, acquire).await.ok()?.ok()
        }
        None => acquire.await.ok(),
    }
}

fn tally(summary: &mut DispatchSummary, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Delivered => {
            summary.processed += 1;
            summary.success_count += 1;
        }
        RecordOutcome::Retrying | RecordOutcome::Failed => {
            summary.processed += 1;
            summary.error_count += 1;
        }
        RecordOutcome::Skipped => summary.skipped += 1,
    }
}
