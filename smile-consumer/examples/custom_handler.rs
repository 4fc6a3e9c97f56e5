//! Consume a subject with a custom handler.
//!
//! ```text
//! NATS_URL=nats://localhost:4222 cargo run --example custom_handler -- 'smile.request.*' my-durable
//! ```
//!
//! Messages without a `"requestId"` field are rejected, so the server redelivers them up to
//! three times.

use smile_consumer::{
    ClientConfig, ConsumerRuntime, HandlerError, MessageEnvelope, NatsTransport,
};
use std::sync::Arc;
use std::time::Duration;

fn handle(envelope: &MessageEnvelope) -> Result<(), HandlerError> {
    let request_id = envelope
        .data
        .get("requestId")
        .and_then(|id| id.as_str())
        .ok_or_else(|| HandlerError::failed("message has no requestId"))?;

    println!(
        "request {} on {} (delivery #{})",
        request_id,
        envelope.subject,
        envelope.delivery_count.unwrap_or(1)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let filter_subject = args.next().unwrap_or_else(|| "smile.request.*".to_string());
    let durable = args.next().unwrap_or_else(|| "smile-example".to_string());
    let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

    let config = ClientConfig::builder(
        url,
        filter_subject,
        durable,
        Duration::from_secs(5),
        Arc::new(handle),
    )
    .with_max_deliver(Some(3))
    .build()?;

    let summary = ConsumerRuntime::new(config, Arc::new(NatsTransport::new()))
        .run()
        .await?;

    println!(
        "stopped: {} acked, {} nacked, {} reconnects",
        summary.stats.acked, summary.stats.nacked, summary.reconnects
    );
    Ok(())
}
