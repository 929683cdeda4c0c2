use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::client::{Deliver, DeliveryRequest};
use crate::config::Backoff;
use crate::error::{FailureReason, StoreError};
use crate::retry::{self, Transition};
use crate::signing::signature_header;
use crate::storage::{ConfigStore, QueueStore};
use crate::types::{DeliveryIntent, EventEnvelope, SubscriberConfig};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Shared, read-only context for all workers of a run.
pub(crate) struct WorkerContext {
    pub queue: Arc<dyn QueueStore>,
    pub configs: Arc<dyn ConfigStore>,
    pub client: Arc<dyn Deliver>,
    pub signature_header: String,
    pub claim_lease: Duration,
    pub backoff: Option<Backoff>,
}

/// What happened to one record of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Delivered,
    Retrying,
    Failed,

    /// Not touched: claimed by another run or already terminal.
    Skipped,
}

impl From<&Transition> for RecordOutcome {
    fn from(transition: &Transition) -> Self {
        match transition {
            Transition::Success { .. } => RecordOutcome::Delivered,
            Transition::Retry { .. } => RecordOutcome::Retrying,
            Transition::Failed { .. } => RecordOutcome::Failed,
        }
    }
}

/// Drive one record through claim, delivery and state transition.
///
/// Delivery failures end up on the record. Only store errors are returned.
#[tracing::instrument(
    name = "process_intent",
    skip_all,
    fields(intent_id = %intent.id, event_type = %intent.event_type)
)]
pub(crate) async fn process_intent(
    ctx: &WorkerContext,
    intent: DeliveryIntent,
) -> Result<RecordOutcome, StoreError> {
    let Some(intent) = ctx.queue.claim(intent.id, ctx.claim_lease).await? else {
        debug!("record claimed elsewhere or already terminal, skipping");
        metric_inc("webhook.delivery.skipped");
        return Ok(RecordOutcome::Skipped);
    };

    let Some(config) = ctx.configs.get_config(&intent.subscriber_id).await? else {
        let reason = FailureReason::Misconfigured(format!(
            "no configuration for subscriber {}",
            intent.subscriber_id
        ));
        return fail_without_attempt(ctx, &intent, reason).await;
    };

    if let Some(Transition::Failed { reason, .. }) =
        retry::check_exhausted(intent.attempt_count, config.max_attempts)
    {
        return fail_without_attempt(ctx, &intent, reason).await;
    }

    let request = match build_request(&intent, &config, &ctx.signature_header, Utc::now()) {
        Ok(request) => request,
        Err(reason) => return fail_without_attempt(ctx, &intent, reason).await,
    };

    let outcome = ctx.client.deliver(&request).await;
    let transition = retry::next_transition(intent.attempt_count, config.max_attempts, outcome.ok);
    let update = retry::update_after_attempt(&transition, &outcome, ctx.backoff.as_ref(), Utc::now());

    ctx.queue.persist(intent.id, &update).await?;

    match &transition {
        Transition::Success { .. } => {
            metric_inc("webhook.delivery.success");
            debug!(
                status_code = outcome.status_code,
                latency_ms = outcome.latency.as_millis() as u64,
                "delivered"
            );
        }
        Transition::Retry { attempt_count } => {
            metric_inc("webhook.delivery.retrying");
            warn!(
                status_code = outcome.status_code,
                attempt_count,
                error = ?outcome.error,
                "delivery failed, will retry"
            );
        }
        Transition::Failed { attempt_count, .. } => {
            metric_inc("webhook.delivery.failed");
            warn!(
                status_code = outcome.status_code,
                attempt_count,
                error = ?outcome.error,
                "delivery failed, max attempts exceeded"
            );
        }
    }

    Ok(RecordOutcome::from(&transition))
}

async fn fail_without_attempt(
    ctx: &WorkerContext,
    intent: &DeliveryIntent,
    reason: FailureReason,
) -> Result<RecordOutcome, StoreError> {
    warn!(error = %reason, "failing record without a delivery attempt");
    let update = retry::update_without_attempt(intent, reason, Utc::now());
    ctx.queue.persist(intent.id, &update).await?;
    metric_inc("webhook.delivery.failed");
    Ok(RecordOutcome::Failed)
}

/// Serialize the envelope once and sign those exact bytes.
pub(crate) fn build_request(
    intent: &DeliveryIntent,
    config: &SubscriberConfig,
    header_name: &str,
    now: DateTime<Utc>,
) -> Result<DeliveryRequest, FailureReason> {
    let url = intent.target_url.trim();
    if url.is_empty() {
        return Err(FailureReason::Misconfigured("missing target url".to_string()));
    }

    let parsed = reqwest::Url::parse(url)
        .map_err(|e| FailureReason::Misconfigured(format!("invalid target url: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FailureReason::Misconfigured(format!(
            "unsupported target url scheme: {}",
            parsed.scheme()
        )));
    }

    let body = serde_json::to_vec(&EventEnvelope::for_intent(intent, now))
        .map_err(|e| FailureReason::Misconfigured(format!("unserializable payload: {}", e)))?;

    let secret = config.secret.as_deref().filter(|s| !s.is_empty());
    let signature = signature_header(secret, header_name, &body)
        .map_err(|_| FailureReason::Misconfigured("invalid signing secret".to_string()))?;

    Ok(DeliveryRequest {
        url: url.to_string(),
        body,
        signature,
    })
}
