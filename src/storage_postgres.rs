use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{ConfigStore, QueueStore};
use crate::types::{
    DeliveryIntent,
    DeliveryStatus,
    IntentId,
    IntentUpdate,
    SubscriberConfig,
    SubscriberId,
};

const INTENT_COLUMNS: &str = "id, subscriber_id, event_type, target_url, payload, status, \
     attempt_count, last_response_code, last_response_body, last_error, \
     last_latency_ms, created_at, completed_at, next_attempt_at";

const OPEN_STATUSES: &str = "('pending', 'retrying')";

/// Queue and subscriber configuration backed by PostgreSQL.
///
/// Tables:
/// - `webhook_deliveries`: one row per delivery intent.
/// - `webhook_subscribers`: per-subscriber secret and attempt bound.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Wrap a connected client, creating the tables if needed.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS webhook_subscribers (
                    id TEXT PRIMARY KEY,
                    secret TEXT,
                    max_attempts INTEGER NOT NULL DEFAULT 3
                );

                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id UUID PRIMARY KEY,
                    subscriber_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    target_url TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_response_code INTEGER,
                    last_response_body TEXT,
                    last_error TEXT,
                    last_latency_ms BIGINT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    completed_at TIMESTAMPTZ,
                    next_attempt_at TIMESTAMPTZ,
                    claimed_until TIMESTAMPTZ
                );

                ALTER TABLE webhook_deliveries ADD COLUMN IF NOT EXISTS last_latency_ms BIGINT;

                CREATE INDEX IF NOT EXISTS webhook_deliveries_due_idx
                    ON webhook_deliveries (created_at)
                    WHERE status IN {OPEN_STATUSES};"
            ))
            .await?;

        Ok(Self { client })
    }

    /// Insert a new intent, as the producer would.
    pub async fn enqueue(&self, intent: &DeliveryIntent) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_deliveries
                    (id, subscriber_id, event_type, target_url, payload, status, attempt_count, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &intent.id.0,
                    &intent.subscriber_id.0,
                    &intent.event_type,
                    &intent.target_url,
                    &intent.payload,
                    &intent.status.as_str(),
                    &to_db_int(intent.attempt_count),
                    &intent.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn upsert_subscriber(
        &self,
        subscriber: &SubscriberId,
        config: &SubscriberConfig,
    ) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_subscribers (id, secret, max_attempts)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE
                 SET secret = EXCLUDED.secret, max_attempts = EXCLUDED.max_attempts",
                &[&subscriber.0, &config.secret, &to_db_int(config.max_attempts)],
            )
            .await?;
        Ok(())
    }

    // Moves an undecodable row out of the queue so it is never handed out again.
    async fn quarantine(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        warn!(intent_id = %id, reason, "quarantining malformed delivery record");
        let sql = format!(
            "UPDATE webhook_deliveries
             SET status = 'failed', last_error = $2, completed_at = now(), claimed_until = NULL
             WHERE id = $1 AND status IN {OPEN_STATUSES}"
        );
        self.client
            .execute(sql.as_str(), &[&id, &format!("malformed record: {}", reason)])
            .await?;
        Ok(())
    }

    async fn decode_or_quarantine(&self, row: &Row) -> Result<Option<DeliveryIntent>, StoreError> {
        match decode_intent(row) {
            Ok(intent) => Ok(Some(intent)),
            Err(reason) => {
                match row.try_get::<_, Uuid>("id") {
                    Ok(id) => self.quarantine(id, &reason).await?,
                    Err(_) => warn!(reason = %reason, "skipping delivery record without a readable id"),
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<DeliveryIntent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {INTENT_COLUMNS}
             FROM webhook_deliveries
             WHERE status IN {OPEN_STATUSES}
               AND (next_attempt_at IS NULL OR next_attempt_at <= now())
               AND (claimed_until IS NULL OR claimed_until <= now())
             ORDER BY created_at ASC, id ASC
             LIMIT $1"
        );
        let rows = self.client.query(sql.as_str(), &[&limit]).await?;

        let mut due = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(intent) = self.decode_or_quarantine(row).await? {
                due.push(intent);
            }
        }
        Ok(due)
    }

    async fn claim(&self, id: IntentId, lease: Duration) -> Result<Option<DeliveryIntent>, StoreError> {
        let sql = format!(
            "UPDATE webhook_deliveries
             SET claimed_until = now() + make_interval(secs => $2)
             WHERE id = $1
               AND status IN {OPEN_STATUSES}
               AND (claimed_until IS NULL OR claimed_until <= now())
             RETURNING {INTENT_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(sql.as_str(), &[&id.0, &lease.as_secs_f64()])
            .await?;

        match row {
            Some(row) => self.decode_or_quarantine(&row).await,
            None => Ok(None),
        }
    }

    async fn persist(&self, id: IntentId, update: &IntentUpdate) -> Result<(), StoreError> {
        let allowed_from: Vec<&str> = [DeliveryStatus::Pending, DeliveryStatus::Retrying]
            .into_iter()
            .filter(|from| from.can_transition_to(update.status))
            .map(|from| from.as_str())
            .collect();

        let code = update.last_response_code.map(i32::from);
        let latency_ms = update
            .last_latency_ms
            .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2,
                     attempt_count = $3,
                     last_response_code = $4,
                     last_response_body = $5,
                     last_error = $6,
                     completed_at = $7,
                     next_attempt_at = $8,
                     last_latency_ms = $10,
                     claimed_until = NULL
                 WHERE id = $1 AND status = ANY($9)",
                &[
                    &id.0,
                    &update.status.as_str(),
                    &to_db_int(update.attempt_count),
                    &code,
                    &update.last_response_body,
                    &update.last_error,
                    &update.completed_at,
                    &update.next_attempt_at,
                    &allowed_from,
                    &latency_ms,
                ],
            )
            .await?;

        if updated == 1 {
            return Ok(());
        }

        let current = self
            .client
            .query_opt("SELECT status FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await?;

        let Some(current) = current else {
            return Err(StoreError::NotFound(id));
        };
        let raw: String = current.try_get("status")?;
        match DeliveryStatus::parse(&raw) {
            Some(from) => Err(StoreError::InvalidTransition {
                id,
                from,
                to: update.status,
            }),
            None => Err(StoreError::Malformed {
                id: id.to_string(),
                reason: format!("unknown status {:?}", raw),
            }),
        }
    }
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn get_config(&self, subscriber: &SubscriberId) -> Result<Option<SubscriberConfig>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT secret, max_attempts FROM webhook_subscribers WHERE id = $1",
                &[&subscriber.0],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let secret: Option<String> = row.try_get("secret")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let max_attempts = u32::try_from(max_attempts).map_err(|_| StoreError::Malformed {
            id: subscriber.0.clone(),
            reason: format!("negative max_attempts {}", max_attempts),
        })?;

        Ok(Some(SubscriberConfig {
            secret,
            max_attempts,
        }))
    }
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn decode_intent(row: &Row) -> Result<DeliveryIntent, String> {
    let id: Uuid = row.try_get("id").map_err(|e| e.to_string())?;

    let raw_status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let status = DeliveryStatus::parse(&raw_status)
        .ok_or_else(|| format!("unknown status {:?}", raw_status))?;

    let attempt_count: i32 = row.try_get("attempt_count").map_err(|e| e.to_string())?;
    let attempt_count = u32::try_from(attempt_count)
        .map_err(|_| format!("negative attempt_count {}", attempt_count))?;

    let code: Option<i32> = row.try_get("last_response_code").map_err(|e| e.to_string())?;
    let last_response_code = code
        .map(u16::try_from)
        .transpose()
        .map_err(|_| format!("response code out of range {:?}", code))?;

    let latency: Option<i64> = row.try_get("last_latency_ms").map_err(|e| e.to_string())?;
    let last_latency_ms = latency
        .map(u64::try_from)
        .transpose()
        .map_err(|_| format!("negative last_latency_ms {:?}", latency))?;

    Ok(DeliveryIntent {
        id: IntentId(id),
        subscriber_id: SubscriberId(row.try_get("subscriber_id").map_err(|e| e.to_string())?),
        event_type: row.try_get("event_type").map_err(|e| e.to_string())?,
        target_url: row.try_get("target_url").map_err(|e| e.to_string())?,
        payload: row.try_get("payload").map_err(|e| e.to_string())?,
        status,
        attempt_count,
        last_response_code,
        last_response_body: row.try_get("last_response_body").map_err(|e| e.to_string())?,
        last_error: row.try_get("last_error").map_err(|e| e.to_string())?,
        last_latency_ms,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        completed_at: row.try_get("completed_at").map_err(|e| e.to_string())?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(|e| e.to_string())?,
    })
}
