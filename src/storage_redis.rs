use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use redis::AsyncCommands;
use tracing::warn;

use crate::error::StoreError;
use crate::storage::{check_transition, ConfigStore, QueueStore};
use crate::types::{DeliveryIntent, DeliveryStatus, IntentId, IntentUpdate, SubscriberConfig, SubscriberId};

/// Queue and subscriber configuration backed by Redis.
///
/// Keys, under `prefix`:
/// - `intent:<id>`: the intent as JSON
/// - `due`: sorted set of non-terminal ids scored by `created_at` millis
/// - `claim:<id>`: in-flight marker with a TTL of the claim lease
/// - `subscriber:<id>`: subscriber config as JSON
/// - `quarantine`: hash of undecodable ids to a `failed` entry holding the
///   decode error and the raw value; the `intent:<id>` key is removed
///
/// Per-record writes are serialized by the claim; `persist` applies its
/// writes in one atomic pipeline.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn quarantine_key(&self) -> String {
        format!("{}:quarantine", self.prefix)
    }

    fn intent_key(&self, id: &str) -> String {
        format!("{}:intent:{}", self.prefix, id)
    }

    fn claim_key(&self, id: &str) -> String {
        format!("{}:claim:{}", self.prefix, id)
    }

    fn subscriber_key(&self, subscriber: &SubscriberId) -> String {
        format!("{}:subscriber:{}", self.prefix, subscriber.0)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_tokio_connection().await?)
    }

    /// Insert a new intent, as the producer would.
    pub async fn enqueue(&self, intent: &DeliveryIntent) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let id = intent.id.to_string();
        let payload = serde_json::to_string(intent)?;

        redis::pipe()
            .atomic()
            .set(self.intent_key(&id), payload)
            .ignore()
            .zadd(self.due_key(), &id, intent.created_at.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn set_subscriber(
        &self,
        subscriber: &SubscriberId,
        config: &SubscriberConfig,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(config)?;
        let _: () = conn.set(self.subscriber_key(subscriber), payload).await?;
        Ok(())
    }

    /// Quarantine entry for an intent that could not be decoded.
    pub async fn quarantine_entry(&self, id: IntentId) -> Result<Option<serde_json::Value>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.hget(self.quarantine_key(), id.to_string()).await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // The record leaves the queue entirely; the quarantine entry is its
    // terminal state.
    async fn quarantine(
        &self,
        conn: &mut redis::aio::Connection,
        id: &str,
        reason: &str,
        raw: &str,
    ) -> Result<(), StoreError> {
        warn!(intent_id = %id, reason = %reason, "quarantining malformed delivery record");
        let entry = serde_json::json!({
            "status": DeliveryStatus::Failed,
            "last_error": format!("malformed record: {}", reason),
            "completed_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "raw": raw,
        });

        redis::pipe()
            .atomic()
            .hset(self.quarantine_key(), id, entry.to_string())
            .ignore()
            .zrem(self.due_key(), id)
            .ignore()
            .del(self.intent_key(id))
            .ignore()
            .del(self.claim_key(id))
            .ignore()
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<DeliveryIntent>, StoreError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let page = limit.max(1) as isize;

        let mut due = Vec::new();
        let mut stale = Vec::new();
        let mut malformed = Vec::new();
        let mut start = 0isize;

        // Removals are deferred so index-based paging stays stable.
        'pages: loop {
            let ids: Vec<String> = conn.zrange(self.due_key(), start, start + page - 1).await?;
            let page_len = ids.len();

            for id in ids {
                if due.len() >= limit {
                    break 'pages;
                }

                let claimed: bool = conn.exists(self.claim_key(&id)).await?;
                if claimed {
                    continue;
                }

                let raw: Option<String> = conn.get(self.intent_key(&id)).await?;
                let Some(raw) = raw else {
                    stale.push(id);
                    continue;
                };

                match serde_json::from_str::<DeliveryIntent>(&raw) {
                    Ok(intent) if intent.status.is_terminal() => stale.push(id),
                    Ok(intent) if intent.is_due(now) => due.push(intent),
                    Ok(_) => {}
                    Err(err) => malformed.push((id, err.to_string(), raw)),
                }
            }

            if due.len() >= limit || page_len < page as usize {
                break;
            }
            start += page;
        }

        for id in stale {
            let _: () = conn.zrem(self.due_key(), &id).await?;
        }

        for (id, reason, raw) in malformed {
            self.quarantine(&mut conn, &id, &reason, &raw).await?;
        }

        Ok(due)
    }

    async fn claim(&self, id: IntentId, lease: Duration) -> Result<Option<DeliveryIntent>, StoreError> {
        let mut conn = self.connection().await?;
        let id_str = id.to_string();
        let claim_key = self.claim_key(&id_str);
        let lease_ms = (lease.as_millis() as u64).max(1);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&claim_key)
            .arg(Utc::now().timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            return Ok(None);
        }

        let raw: Option<String> = conn.get(self.intent_key(&id_str)).await?;
        let Some(raw) = raw else {
            let _: () = conn.del(&claim_key).await?;
            return Err(StoreError::NotFound(id));
        };

        let intent: DeliveryIntent = match serde_json::from_str(&raw) {
            Ok(intent) => intent,
            Err(err) => {
                self.quarantine(&mut conn, &id_str, &err.to_string(), &raw).await?;
                return Ok(None);
            }
        };

        if intent.status.is_terminal() {
            let _: () = conn.del(&claim_key).await?;
            return Ok(None);
        }

        Ok(Some(intent))
    }

    async fn persist(&self, id: IntentId, update: &IntentUpdate) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let id_str = id.to_string();
        let intent_key = self.intent_key(&id_str);

        let raw: Option<String> = conn.get(&intent_key).await?;
        let raw = raw.ok_or(StoreError::NotFound(id))?;
        let mut intent: DeliveryIntent = serde_json::from_str(&raw)?;

        check_transition(id, intent.status, update.status)?;
        intent.apply(update);
        let payload = serde_json::to_string(&intent)?;

        let mut pipe = redis::pipe();
        pipe.atomic().set(&intent_key, payload).ignore();
        if intent.status.is_terminal() {
            pipe.zrem(self.due_key(), &id_str).ignore();
        }
        pipe.del(self.claim_key(&id_str)).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}

#[async_trait]
impl ConfigStore for RedisStore {
    async fn get_config(&self, subscriber: &SubscriberId) -> Result<Option<SubscriberConfig>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.subscriber_key(subscriber)).await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
