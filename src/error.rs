use crate::types::{DeliveryStatus, IntentId};

/// Errors that abort a whole dispatch run.
///
/// Per-record delivery failures are never reported here; they are
/// recorded on the record itself.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The queue store failed; remaining records were not started.
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    /// Another run on this dispatcher is still in progress.
    #[error("dispatch run already in progress")]
    AlreadyRunning,

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Infrastructure errors raised by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("delivery intent not found: {0}")]
    NotFound(IntentId),

    /// Update would violate the status state machine.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: IntentId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Reasons why a delivery attempt failed, as recorded in `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("endpoint returned HTTP {status}")]
    Http { status: u16 },

    /// Record cannot be delivered as configured. No attempt is made.
    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("max attempts exceeded")]
    MaxAttemptsExceeded,
}

/// Invalid dispatcher configuration from the environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub reason: String,
}
