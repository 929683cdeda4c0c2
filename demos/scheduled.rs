use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use webhook_delivery::{DeliveryIntent, Dispatcher, DispatcherConfig, InMemoryStore, SubscriberConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(InMemoryStore::new());
    store
        .set_config("orders", SubscriberConfig::new().with_secret("supersecret"))
        .await;
    store
        .insert(DeliveryIntent::new(
            "orders",
            "order.created",
            "https://example.com/webhook",
            json!({"id": 123}),
        ))
        .await;

    let config = DispatcherConfig::from_env()?;
    let dispatcher = Dispatcher::with_http_client(store.clone(), store, config)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    for _ in 0..3 {
        ticker.tick().await;
        let summary = dispatcher.run_once().await?;
        println!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}
