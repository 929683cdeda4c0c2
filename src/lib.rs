//! Outbound webhook delivery.
//!
//! Turns persisted delivery intents into signed HTTP notifications to
//! subscriber endpoints, with bounded retries and terminal status
//! resolution.
//!
//! One [`Dispatcher::run_once`] call fetches a bounded batch of due
//! records (oldest first), delivers each with bounded fan-out, moves it
//! through the `pending -> retrying -> success | failed` state machine and
//! returns a [`DispatchSummary`]. The dispatcher keeps nothing in memory
//! between runs; an external scheduler decides when to call it.
//!
//! ## Guarantees
//! - At-least-once delivery. Subscribers deduplicate on `event_id`.
//! - `attempt_count` grows by exactly one per failed attempt and never
//!   passes the subscriber's `max_attempts`.
//! - Terminal records are never fetched or mutated again.
//! - Every network call carries a timeout.
//!
//! ## Wire format
//! `POST <target_url>` with `Content-Type: application/json`, a
//! `User-Agent` of `WebhookDelivery-Webhook/<version>` and, when the subscriber
//! has a secret, `X-Webhook-Signature: <hex HMAC-SHA256 of the body>`.
//! The body is `{"event_type", "event_id", "timestamp", "data"}`. Redirects
//! are not followed; a 3xx is a failed attempt.

mod client;
mod config;
mod dispatcher;
mod error;
mod retry;
mod signing;
mod storage;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use client::{AttemptOutcome, Deliver, DeliveryRequest, HttpDeliveryClient, BODY_SNIPPET_LIMIT};
pub use config::{Backoff, DispatcherConfig, CLAIM_LEASE_MARGIN, MAX_CONCURRENCY_LIMIT};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, FailureReason, StoreError};
pub use retry::{check_exhausted, next_transition, Transition};
pub use signing::{compute_signature, signature_header, verify_signature, DEFAULT_SIGNATURE_HEADER};
pub use storage::{ConfigStore, InMemoryStore, QueueStore};
pub use types::{
    DeliveryIntent,
    DeliveryStatus,
    DispatchSummary,
    EventEnvelope,
    IntentId,
    IntentUpdate,
    SubscriberConfig,
    SubscriberId,
};
pub use worker::RecordOutcome;

#[cfg(feature = "redis")]
pub use storage_redis::RedisStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
