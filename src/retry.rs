//! Delivery state machine.
//!
//! ```text
//! pending ──ok──────────────► success
//!    │                           ▲
//!    └─fail──► retrying ──ok─────┘
//!                 │  ▲
//!                 │  └─fail (attempt_count + 1 < max)
//!                 └────fail (attempt_count + 1 >= max) ──► failed
//! ```
//!
//! Everything here is pure: callers supply the current record, its
//! subscriber's `max_attempts` and the attempt outcome, and get back the
//! update to persist.

use chrono::{DateTime, Utc};

use crate::client::AttemptOutcome;
use crate::config::Backoff;
use crate::error::FailureReason;
use crate::types::{DeliveryIntent, DeliveryStatus, IntentUpdate};

/// Next lifecycle step for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Delivered. `attempt_count` is unchanged.
    Success { attempt_count: u32 },

    /// Failed, another attempt is permitted.
    Retry { attempt_count: u32 },

    /// Terminally failed.
    Failed {
        attempt_count: u32,
        reason: FailureReason,
    },
}

impl Transition {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Transition::Success { .. } => DeliveryStatus::Success,
            Transition::Retry { .. } => DeliveryStatus::Retrying,
            Transition::Failed { .. } => DeliveryStatus::Failed,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        match self {
            Transition::Success { attempt_count }
            | Transition::Retry { attempt_count }
            | Transition::Failed { attempt_count, .. } => *attempt_count,
        }
    }
}

/// Check made on a freshly read record before any delivery.
///
/// A record that already used up its attempts (e.g. `max_attempts` was
/// lowered after the fact) goes straight to `failed`.
pub fn check_exhausted(attempt_count: u32, max_attempts: u32) -> Option<Transition> {
    if attempt_count >= max_attempts {
        Some(Transition::Failed {
            attempt_count,
            reason: FailureReason::MaxAttemptsExceeded,
        })
    } else {
        None
    }
}

/// Decide the next state after one delivery attempt.
///
/// A failed attempt increments `attempt_count` by exactly one. The failure
/// that brings it to `max_attempts` is terminal.
pub fn next_transition(attempt_count: u32, max_attempts: u32, ok: bool) -> Transition {
    if ok {
        return Transition::Success { attempt_count };
    }

    let attempt_count = attempt_count.saturating_add(1);
    if attempt_count >= max_attempts {
        Transition::Failed {
            attempt_count,
            reason: FailureReason::MaxAttemptsExceeded,
        }
    } else {
        Transition::Retry { attempt_count }
    }
}

/// Build the persisted update for a transition that followed an attempt.
pub fn update_after_attempt(
    transition: &Transition,
    outcome: &AttemptOutcome,
    backoff: Option<&Backoff>,
    now: DateTime<Utc>,
) -> IntentUpdate {
    let last_error = match transition {
        Transition::Success { .. } => None,
        Transition::Failed { reason, .. } => Some(reason.to_string()),
        Transition::Retry { .. } => outcome.error.as_ref().map(|e| e.to_string()),
    };

    let next_attempt_at = match (transition, backoff) {
        (Transition::Retry { attempt_count }, Some(backoff)) => {
            chrono::Duration::from_std(backoff.delay_for(*attempt_count))
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
        }
        _ => None,
    };

    IntentUpdate {
        status: transition.status(),
        attempt_count: transition.attempt_count(),
        last_response_code: Some(outcome.status_code),
        last_response_body: Some(outcome.body_snippet.clone()),
        last_error,
        last_latency_ms: Some(u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX)),
        completed_at: completion_time(transition, now),
        next_attempt_at,
    }
}

/// Build the update for a record moved to `failed` without an attempt.
///
/// Response fields keep their previous values.
pub fn update_without_attempt(
    intent: &DeliveryIntent,
    reason: FailureReason,
    now: DateTime<Utc>,
) -> IntentUpdate {
    IntentUpdate {
        status: DeliveryStatus::Failed,
        attempt_count: intent.attempt_count,
        last_response_code: intent.last_response_code,
        last_response_body: intent.last_response_body.clone(),
        last_error: Some(reason.to_string()),
        last_latency_ms: intent.last_latency_ms,
        completed_at: Some(now),
        next_attempt_at: None,
    }
}

fn completion_time(transition: &Transition, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match transition {
        Transition::Retry { .. } => None,
        Transition::Success { .. } | Transition::Failed { .. } => Some(now),
    }
}
