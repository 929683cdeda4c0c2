use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use webhook_delivery::{
    AttemptOutcome,
    ConfigStore,
    Deliver,
    DeliveryIntent,
    DeliveryRequest,
    DeliveryStatus,
    DispatchError,
    DispatchSummary,
    Dispatcher,
    DispatcherConfig,
    InMemoryStore,
    IntentId,
    IntentUpdate,
    QueueStore,
    StoreError,
    SubscriberConfig,
};

fn dispatcher(store: &Arc<InMemoryStore>, config: DispatcherConfig) -> Dispatcher {
    Dispatcher::with_http_client(store.clone(), store.clone(), config).unwrap()
}

fn intent_for(url: &str, subscriber: &str, created_at: DateTime<Utc>) -> DeliveryIntent {
    DeliveryIntent::new(subscriber, "call.completed", url, json!({"a": 1})).with_created_at(created_at)
}

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

async fn status_of(store: &InMemoryStore, id: IntentId) -> (DeliveryStatus, u32) {
    let intent = store.get(id).await.unwrap();
    (intent.status, intent.attempt_count)
}

#[tokio::test]
async fn retries_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("acme", SubscriberConfig::new().with_max_attempts(3))
        .await;
    let intent = intent_for(&server.uri(), "acme", base_time());
    store.insert(intent.clone()).await;

    let dispatcher = dispatcher(&store, DispatcherConfig::default());

    let first = dispatcher.run_once().await.unwrap();
    assert_eq!(first, DispatchSummary { processed: 1, success_count: 0, error_count: 1, skipped: 0 });
    assert_eq!(status_of(&store, intent.id).await, (DeliveryStatus::Retrying, 1));
    assert!(store.get(intent.id).await.unwrap().last_latency_ms.is_some());

    dispatcher.run_once().await.unwrap();
    assert_eq!(status_of(&store, intent.id).await, (DeliveryStatus::Retrying, 2));
    assert!(store.get(intent.id).await.unwrap().completed_at.is_none());

    let third = dispatcher.run_once().await.unwrap();
    assert_eq!(third.success_count, 1);

    let done = store.get(intent.id).await.unwrap();
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.attempt_count, 2);
    assert_eq!(done.last_response_code, Some(200));
    assert_eq!(done.last_response_body.as_deref(), Some("ok"));
    assert!(done.last_latency_ms.is_some());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn exhausts_attempts_and_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("acme", SubscriberConfig::new().with_max_attempts(2))
        .await;
    let intent = intent_for(&server.uri(), "acme", base_time());
    store.insert(intent.clone()).await;

    let dispatcher = dispatcher(&store, DispatcherConfig::default());

    dispatcher.run_once().await.unwrap();
    assert_eq!(status_of(&store, intent.id).await, (DeliveryStatus::Retrying, 1));

    dispatcher.run_once().await.unwrap();
    let failed = store.get(intent.id).await.unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.attempt_count, 2);
    assert_eq!(failed.last_error.as_deref(), Some("max attempts exceeded"));
    assert_eq!(failed.last_response_code, Some(500));
    assert!(failed.completed_at.is_some());

    // terminal: never selected or touched again
    let after = dispatcher.run_once().await.unwrap();
    assert_eq!(after, DispatchSummary::default());
    assert_eq!(store.get(intent.id).await.unwrap(), failed);

    server.verify().await;
}

#[tokio::test]
async fn signs_exact_body_only_when_secret_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("signed", SubscriberConfig::new().with_secret("s3cr3t"))
        .await;
    store.set_config("unsigned", SubscriberConfig::new()).await;

    let signed = intent_for(&format!("{}/signed", server.uri()), "signed", base_time());
    let unsigned = intent_for(
        &format!("{}/unsigned", server.uri()),
        "unsigned",
        base_time() + chrono::Duration::seconds(1),
    );
    store.insert(signed.clone()).await;
    store.insert(unsigned.clone()).await;

    dispatcher(&store, DispatcherConfig::default()).run_once().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    for request in &requests {
        assert_eq!(
            request.headers.get("content-type").unwrap().to_str().unwrap(),
            "application/json"
        );
        assert!(request
            .headers
            .get("user-agent")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("WebhookDelivery-Webhook/"));

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["event_type"], "call.completed");
        assert_eq!(body["data"], json!({"a": 1}));
        assert!(DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());

        if request.url.path() == "/signed" {
            assert_eq!(body["event_id"], signed.id.to_string());

            let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cr3t").unwrap();
            mac.update(&request.body);
            let expected = hex::encode(mac.finalize().into_bytes());

            let header = request.headers.get("x-webhook-signature").unwrap();
            assert_eq!(header.to_str().unwrap(), expected);
        } else {
            assert_eq!(body["event_id"], unsigned.id.to_string());
            assert!(request.headers.get("x-webhook-signature").is_none());
        }
    }

    server.verify().await;
}

#[tokio::test]
async fn batch_limit_takes_oldest_first() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(60)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.set_config("acme", SubscriberConfig::new()).await;

    let mut ids = Vec::new();
    for n in 0..60 {
        let intent = intent_for(&server.uri(), "acme", base_time() + chrono::Duration::seconds(n));
        ids.push(intent.id);
        store.insert(intent).await;
    }

    let dispatcher = dispatcher(&store, DispatcherConfig::default());

    let first = dispatcher.run_once().await.unwrap();
    assert_eq!(first.processed, 50);
    assert_eq!(first.success_count, 50);

    for (n, id) in ids.iter().enumerate() {
        let (status, _) = status_of(&store, *id).await;
        if n < 50 {
            assert_eq!(status, DeliveryStatus::Success, "record {}", n);
        } else {
            assert_eq!(status, DeliveryStatus::Pending, "record {}", n);
        }
    }

    let second = dispatcher.run_once().await.unwrap();
    assert_eq!(second.processed, 10);
    assert!(store.all().await.iter().all(|i| i.status == DeliveryStatus::Success));

    server.verify().await;
}

#[tokio::test]
async fn timeout_is_retried_like_any_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.set_config("acme", SubscriberConfig::new()).await;
    let intent = intent_for(&server.uri(), "acme", base_time());
    store.insert(intent.clone()).await;

    let config = DispatcherConfig {
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let summary = dispatcher(&store, config).run_once().await.unwrap();
    assert_eq!(summary.error_count, 1);

    let record = store.get(intent.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Retrying);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_response_code, Some(0));
    assert_eq!(record.last_error.as_deref(), Some("request timed out"));
    assert!(record.completed_at.is_none());
}

#[tokio::test]
async fn misconfigured_records_fail_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.set_config("acme", SubscriberConfig::new()).await;

    let no_config = intent_for(&server.uri(), "unknown", base_time());
    let no_url = intent_for("", "acme", base_time() + chrono::Duration::seconds(1));
    store.insert(no_config.clone()).await;
    store.insert(no_url.clone()).await;

    let summary = dispatcher(&store, DispatcherConfig::default()).run_once().await.unwrap();
    assert_eq!(summary, DispatchSummary { processed: 2, success_count: 0, error_count: 2, skipped: 0 });

    let no_config = store.get(no_config.id).await.unwrap();
    assert_eq!(no_config.status, DeliveryStatus::Failed);
    assert_eq!(no_config.attempt_count, 0);
    assert!(no_config.completed_at.is_some());
    assert_eq!(
        no_config.last_error.as_deref(),
        Some("misconfigured: no configuration for subscriber unknown")
    );

    let no_url = store.get(no_url.id).await.unwrap();
    assert_eq!(no_url.status, DeliveryStatus::Failed);
    assert_eq!(no_url.last_error.as_deref(), Some("misconfigured: missing target url"));

    server.verify().await;
}

#[tokio::test]
async fn records_past_a_lowered_bound_fail_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("acme", SubscriberConfig::new().with_max_attempts(2))
        .await;
    let intent = intent_for(&server.uri(), "acme", base_time()).with_attempt_count(3);
    store.insert(intent.clone()).await;

    let summary = dispatcher(&store, DispatcherConfig::default()).run_once().await.unwrap();
    assert_eq!(summary.error_count, 1);

    let record = store.get(intent.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.last_error.as_deref(), Some("max attempts exceeded"));

    server.verify().await;
}

#[tokio::test]
async fn every_record_terminates_within_max_attempts_cycles() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("acme", SubscriberConfig::new().with_max_attempts(4))
        .await;
    for n in 0..5 {
        store
            .insert(intent_for(&server.uri(), "acme", base_time() + chrono::Duration::seconds(n)))
            .await;
    }

    let dispatcher = dispatcher(&store, DispatcherConfig::default());
    for cycle in 1..=4u32 {
        dispatcher.run_once().await.unwrap();
        for record in store.all().await {
            assert_eq!(record.attempt_count, cycle);
            assert!(record.attempt_count <= 4);
        }
    }

    for record in store.all().await {
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempt_count, 4);
    }
}

struct SlowCountingClient {
    delay: Duration,
    status: u16,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowCountingClient {
    fn new(delay: Duration) -> Self {
        Self::answering(delay, 200)
    }

    fn answering(delay: Duration, status: u16) -> Self {
        Self {
            delay,
            status,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Deliver for SlowCountingClient {
    async fn deliver(&self, _request: &DeliveryRequest) -> AttemptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        AttemptOutcome::from_response(self.status, "", self.delay)
    }
}

async fn seeded_store(count: i64) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.set_config("acme", SubscriberConfig::new()).await;
    for n in 0..count {
        store
            .insert(intent_for(
                "http://subscriber.invalid/hook",
                "acme",
                base_time() + chrono::Duration::seconds(n),
            ))
            .await;
    }
    store
}

#[tokio::test]
async fn fan_out_is_bounded() {
    let store = seeded_store(12).await;
    let client = Arc::new(SlowCountingClient::new(Duration::from_millis(30)));
    let config = DispatcherConfig {
        max_concurrency: 3,
        ..Default::default()
    };

    let dispatcher = Dispatcher::new(store.clone(), store.clone(), client.clone(), config);
    let summary = dispatcher.run_once().await.unwrap();

    assert_eq!(summary.success_count, 12);
    assert_eq!(client.calls.load(Ordering::SeqCst), 12);
    assert!(client.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn deadline_stops_new_records_but_finishes_in_flight() {
    let store = seeded_store(3).await;
    let client = Arc::new(SlowCountingClient::new(Duration::from_millis(300)));
    let config = DispatcherConfig {
        max_concurrency: 1,
        run_deadline: Some(Duration::from_millis(100)),
        ..Default::default()
    };

    let dispatcher = Dispatcher::new(store.clone(), store.clone(), client.clone(), config);
    let summary = dispatcher.run_once().await.unwrap();

    assert_eq!(summary, DispatchSummary { processed: 1, success_count: 1, error_count: 0, skipped: 2 });

    let records = store.all().await;
    assert_eq!(records[0].status, DeliveryStatus::Success);
    assert_eq!(records[1].status, DeliveryStatus::Pending);
    assert_eq!(records[2].status, DeliveryStatus::Pending);

    // left over records are picked up by the next run
    let next = dispatcher.run_once().await.unwrap();
    assert_eq!(next.processed, 1);
}

#[tokio::test]
async fn concurrent_runs_on_one_dispatcher_are_rejected() {
    let store = seeded_store(1).await;
    let client = Arc::new(SlowCountingClient::new(Duration::from_millis(300)));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        store.clone(),
        client,
        DispatcherConfig::default(),
    ));

    let background = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_once().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(dispatcher.run_once().await, Err(DispatchError::AlreadyRunning)));
    assert_eq!(background.await.unwrap().unwrap().success_count, 1);
}

#[tokio::test]
async fn separate_dispatchers_never_deliver_a_record_twice() {
    let store = seeded_store(20).await;
    let client = Arc::new(SlowCountingClient::new(Duration::from_millis(20)));

    let first = Dispatcher::new(store.clone(), store.clone(), client.clone(), DispatcherConfig::default());
    let second = Dispatcher::new(store.clone(), store.clone(), client.clone(), DispatcherConfig::default());

    let (a, b) = tokio::join!(first.run_once(), second.run_once());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(client.calls.load(Ordering::SeqCst), 20);
    assert_eq!(a.success_count + b.success_count, 20);
    assert!(store.all().await.iter().all(|i| i.status == DeliveryStatus::Success));
}

#[tokio::test]
async fn short_claim_lease_does_not_expire_mid_attempt() {
    let store = seeded_store(1).await;
    let client = Arc::new(SlowCountingClient::answering(Duration::from_millis(300), 500));
    let config = DispatcherConfig {
        claim_lease: Duration::from_millis(100),
        ..Default::default()
    };

    let first = Dispatcher::new(store.clone(), store.clone(), client.clone(), config.clone());
    let second = Dispatcher::new(store.clone(), store.clone(), client.clone(), config);

    let (a, b) = tokio::join!(first.run_once(), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        second.run_once().await
    });
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.error_count + b.error_count, 1);

    let record = &store.all().await[0];
    assert_eq!(record.status, DeliveryStatus::Retrying);
    assert_eq!(record.attempt_count, 1);
}

struct UnreachableStore;

#[async_trait]
impl QueueStore for UnreachableStore {
    async fn fetch_due(&self, _limit: usize) -> Result<Vec<DeliveryIntent>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn claim(&self, _id: IntentId, _lease: Duration) -> Result<Option<DeliveryIntent>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn persist(&self, _id: IntentId, _update: &IntentUpdate) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn unreachable_queue_store_aborts_the_run() {
    let configs: Arc<dyn ConfigStore> = Arc::new(InMemoryStore::new());
    let client = Arc::new(SlowCountingClient::new(Duration::ZERO));
    let dispatcher = Dispatcher::new(
        Arc::new(UnreachableStore),
        configs,
        client.clone(),
        DispatcherConfig::default(),
    );

    let result = dispatcher.run_once().await;

    assert!(matches!(result, Err(DispatchError::Store(StoreError::Unavailable(_)))));
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

/// Serves records from an in-memory store but fails every write.
struct FailingWrites {
    inner: Arc<InMemoryStore>,
}

#[async_trait]
impl QueueStore for FailingWrites {
    async fn fetch_due(&self, limit: usize) -> Result<Vec<DeliveryIntent>, StoreError> {
        self.inner.fetch_due(limit).await
    }

    async fn claim(&self, id: IntentId, lease: Duration) -> Result<Option<DeliveryIntent>, StoreError> {
        self.inner.claim(id, lease).await
    }

    async fn persist(&self, _id: IntentId, _update: &IntentUpdate) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("write failed".to_string()))
    }
}

#[tokio::test]
async fn persist_failure_stops_the_batch() {
    let store = seeded_store(5).await;
    let client = Arc::new(SlowCountingClient::new(Duration::from_millis(10)));
    let config = DispatcherConfig {
        max_concurrency: 1,
        ..Default::default()
    };

    let dispatcher = Dispatcher::new(
        Arc::new(FailingWrites { inner: store.clone() }),
        store.clone(),
        client.clone(),
        config,
    );

    let result = dispatcher.run_once().await;

    assert!(matches!(result, Err(DispatchError::Store(_))));
    assert!(client.calls.load(Ordering::SeqCst) < 5);
    assert!(store.all().await.iter().all(|i| i.status == DeliveryStatus::Pending));
}
