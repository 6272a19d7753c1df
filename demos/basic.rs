use webhook_engine::{DeliveryEngine, EngineConfig, Event, Webhook};

#[tokio::main]
async fn main() {
    let mut engine = DeliveryEngine::new(EngineConfig::default()).expect("valid config");

    let webhook = Webhook::new("wh_orders", "user_1", "https://example.com/webhook")
        .with_secret(b"supersecret".to_vec())
        .with_event_type("order.*")
        .with_rate_limit(100);

    engine.register_webhook(webhook).await.expect("valid webhook");

    let event = Event::new("evt_123", "order.paid", serde_json::json!({ "id": 123 }));
    let created = engine.on_event(&event).await.expect("engine running");
    println!("created {created} delivery record(s)");

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    engine.shutdown().await;
}
