use webhook_engine::verify_webhook_request;

fn main() {
    let headers = vec![
        ("X-Webhook-Signature", "sha256=abcd..."),
        ("X-Webhook-Timestamp", "1700000000"),
    ];

    let payload = br#"{"event_id":"evt_123","type":"order.paid","payload":{"id":123},"timestamp":1700000000000}"#;
    let now_secs = 1_700_000_200;

    match verify_webhook_request(headers, payload, b"supersecret", 300, now_secs) {
        Ok(()) => println!("signature verified"),
        Err(e) => println!("rejected: {e:?}"),
    }
}
