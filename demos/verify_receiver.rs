use webhook_delivery::{compute_signature, verify_signature};

fn main() {
    let secret = b"supersecret";
    let body = br#"{"event_type":"order.created","event_id":"3f1c","timestamp":"2024-01-01T00:00:00.000Z","data":{"id":123}}"#;

    // What the sender puts in X-Webhook-Signature.
    let header = match compute_signature(secret, body) {
        Ok(signature) => signature,
        Err(err) => {
            eprintln!("bad secret: {}", err);
            return;
        }
    };

    if verify_signature(secret, body, &header) {
        println!("signature ok");
    } else {
        println!("signature mismatch, rejecting");
    }
}
