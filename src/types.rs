use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a delivery intent.
///
/// Also sent to subscribers as `event_id`, which they use as their
/// idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key into the subscriber configuration store.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscriber IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery lifecycle status of an intent.
///
/// `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "retrying" => Some(DeliveryStatus::Retrying),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    /// Whether a record in this status may be moved to `next`.
    ///
    /// `Pending` is never re-entered and terminal states are never left.
    /// `Pending -> Failed` is allowed for records that can never be
    /// attempted (misconfigured, or a subscriber with a single attempt).
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (_, DeliveryStatus::Pending) => false,
            (DeliveryStatus::Success | DeliveryStatus::Failed, _) => false,
            _ => true,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted "notify subscriber X about event Y" record.
///
/// Created by an external producer in `Pending` state. Only the dispatcher
/// mutates it, one record at a time, through [`IntentUpdate`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryIntent {
    pub id: IntentId,
    pub subscriber_id: SubscriberId,
    pub event_type: String,
    pub target_url: String,

    /// Opaque event data, delivered as the envelope's `data` field.
    pub payload: serde_json::Value,

    pub status: DeliveryStatus,

    /// Number of failed attempts so far.
    pub attempt_count: u32,

    pub last_response_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,

    /// Wall-clock duration of the last attempt.
    #[serde(default)]
    pub last_latency_ms: Option<u64>,

    pub created_at: DateTime<Utc>,

    /// Set iff `status` is terminal.
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time of the next attempt when retry backoff is enabled.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryIntent {
    /// Create a new pending intent.
    pub fn new(
        subscriber_id: impl Into<String>,
        event_type: impl Into<String>,
        target_url: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: IntentId::new(),
            subscriber_id: SubscriberId(subscriber_id.into()),
            event_type: event_type.into(),
            target_url: target_url.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_response_code: None,
            last_response_body: None,
            last_error: None,
            last_latency_ms: None,
            created_at: Utc::now(),
            completed_at: None,
            next_attempt_at: None,
        }
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Seed a prior attempt count. A pending record with failed
    /// attempts behind it is `Retrying`.
    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        if attempt_count > 0 && self.status == DeliveryStatus::Pending {
            self.status = DeliveryStatus::Retrying;
        }
        self
    }

    /// Whether the record may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &IntentUpdate) {
        self.status = update.status;
        self.attempt_count = update.attempt_count;
        self.last_response_code = update.last_response_code;
        self.last_response_body = update.last_response_body.clone();
        self.last_error = update.last_error.clone();
        self.last_latency_ms = update.last_latency_ms;
        self.completed_at = update.completed_at;
        self.next_attempt_at = update.next_attempt_at;
    }
}

/// Per-subscriber delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Shared secret for signing. `None` disables the signature header.
    pub secret: Option<String>,

    /// Upper bound on `attempt_count` before an intent becomes `Failed`.
    pub max_attempts: u32,
}

impl SubscriberConfig {
    /// Defaults: no secret, 3 attempts.
    pub fn new() -> Self {
        Self {
            secret: None,
            max_attempts: 3,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-record update written back after an attempt.
///
/// Every field is written, so a persisted update fully describes the
/// record's delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentUpdate {
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_response_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Body sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_id: String,

    /// ISO-8601 time of this attempt.
    pub timestamp: String,

    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn for_intent(intent: &DeliveryIntent, now: DateTime<Utc>) -> Self {
        Self {
            event_type: intent.event_type.clone(),
            event_id: intent.id.to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: intent.payload.clone(),
        }
    }
}

/// Result of one dispatcher invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Records taken through a state transition in this run.
    pub processed: usize,
    pub success_count: usize,

    /// Records that moved to `retrying` or `failed`.
    pub error_count: usize,

    /// Batch records not started: deadline reached or claimed elsewhere.
    pub skipped: usize,
}
