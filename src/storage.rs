use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::types::{DeliveryIntent, DeliveryStatus, IntentId, IntentUpdate, SubscriberConfig, SubscriberId};

/// Durable queue of delivery intents.
///
/// Every mutation is a single-record update; nothing is transactional
/// across records.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Non-terminal, unclaimed, due records, oldest `created_at` first,
    /// at most `limit` of them.
    async fn fetch_due(&self, limit: usize) -> Result<Vec<DeliveryIntent>, StoreError>;

    /// Mark a record as in flight for `lease` and return its current state.
    ///
    /// Returns `None` if the record is terminal or already claimed by
    /// another run.
    async fn claim(&self, id: IntentId, lease: Duration) -> Result<Option<DeliveryIntent>, StoreError>;

    /// Write an update and release the claim.
    ///
    /// Fails with `InvalidTransition` if the update would leave a terminal
    /// state or re-enter `pending`.
    async fn persist(&self, id: IntentId, update: &IntentUpdate) -> Result<(), StoreError>;
}

/// Per-subscriber configuration lookup.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, subscriber: &SubscriberId) -> Result<Option<SubscriberConfig>, StoreError>;
}

pub(crate) fn check_transition(
    id: IntentId,
    from: DeliveryStatus,
    to: DeliveryStatus,
) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { id, from, to })
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-memory store for tests and lightweight deployments.
#[derive(Default)]
pub struct InMemoryStore {
    intents: Mutex<HashMap<IntentId, DeliveryIntent>>,
    claims: Mutex<HashMap<IntentId, DateTime<Utc>>>,
    configs: RwLock<HashMap<SubscriberId, SubscriberConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an intent, as the external producer would.
    pub async fn insert(&self, intent: DeliveryIntent) {
        self.intents.lock().await.insert(intent.id, intent);
    }

    pub async fn get(&self, id: IntentId) -> Option<DeliveryIntent> {
        self.intents.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<DeliveryIntent> {
        let mut all: Vec<_> = self.intents.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn set_config(&self, subscriber: impl Into<String>, config: SubscriberConfig) {
        self.configs
            .write()
            .await
            .insert(SubscriberId(subscriber.into()), config);
    }

    fn is_claimed(claims: &HashMap<IntentId, DateTime<Utc>>, id: &IntentId, now: DateTime<Utc>) -> bool {
        claims.get(id).map_or(false, |until| *until > now)
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<DeliveryIntent>, StoreError> {
        let now = Utc::now();
        let intents = self.intents.lock().await;
        let claims = self.claims.lock().await;

        let mut due: Vec<DeliveryIntent> = intents
            .values()
            .filter(|intent| intent.is_due(now))
            .filter(|intent| !Self::is_claimed(&claims, &intent.id, now))
            .cloned()
            .collect();

        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, id: IntentId, lease: Duration) -> Result<Option<DeliveryIntent>, StoreError> {
        let now = Utc::now();
        let intents = self.intents.lock().await;
        let mut claims = self.claims.lock().await;

        let intent = intents.get(&id).ok_or(StoreError::NotFound(id))?;
        if intent.status.is_terminal() || Self::is_claimed(&claims, &id, now) {
            return Ok(None);
        }

        claims.insert(id, lease_deadline(now, lease));
        Ok(Some(intent.clone()))
    }

    async fn persist(&self, id: IntentId, update: &IntentUpdate) -> Result<(), StoreError> {
        let mut intents = self.intents.lock().await;
        let intent = intents.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        check_transition(id, intent.status, update.status)?;
        intent.apply(update);

        self.claims.lock().await.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn get_config(&self, subscriber: &SubscriberId) -> Result<Option<SubscriberConfig>, StoreError> {
        Ok(self.configs.read().await.get(subscriber).cloned())
    }
}
