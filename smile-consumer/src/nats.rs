//! NATS JetStream transport.
//!
//! Connections are plain `async-nats` clients. Subscriptions are durable pull consumers
//! with explicit acks, located through the stream that owns the configured subject.
//! Messages are pulled one at a time, and the consumer allows a single unacknowledged
//! message, so nothing is fetched while a handler is still working.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    response::Response,
    AckKind,
};
use async_nats::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::envelope::{Acknowledger, Delivery, ResolutionToken};
use crate::error::TransportError;
use crate::transport::{
    ConnectOptions, Connection, Credentials, LinkStatus, MessageSource, SubscriptionRequest,
    Transport,
};
use crate::types::DeliverStart;

/// Upper bound on flushing pending acks while closing a healthy client.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of a pull's expiry before the request is given up locally.
const PULL_GRACE: Duration = Duration::from_secs(1);

/// [`Transport`] backed by `async-nats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsTransport;

impl NatsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let (link_tx, _) = watch::channel(LinkStatus::Up);
        let link_tx = Arc::new(link_tx);
        let events = Arc::clone(&link_tx);

        let mut nats_options = async_nats::ConnectOptions::new()
            .name(&options.client_name)
            .connection_timeout(options.connect_timeout)
            .event_callback(move |event| {
                let events = Arc::clone(&events);
                async move {
                    match event {
                        Event::Disconnected => {
                            events.send_replace(LinkStatus::Down);
                        }
                        Event::Connected => {
                            events.send_replace(LinkStatus::Up);
                        }
                        other => tracing::debug!(event = ?other, "NATS client event"),
                    }
                }
            });

        match &options.credentials {
            Credentials::None => {}
            Credentials::UserPassword { username, password } => {
                nats_options = nats_options.user_and_password(username.clone(), password.clone());
            }
            Credentials::Tls {
                cert_file,
                key_file,
                root_ca,
            } => {
                nats_options = nats_options
                    .add_client_certificate(cert_file.clone(), key_file.clone())
                    .require_tls(true);
                if let Some(root_ca) = root_ca {
                    nats_options = nats_options.add_root_certificates(root_ca.clone());
                }
            }
        }

        let client = nats_options
            .connect(options.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(NatsConnection {
            client: Some(client),
            link_tx,
            flush_timeout: options.connect_timeout,
        }))
    }
}

/// One `async-nats` client.
pub struct NatsConnection {
    client: Option<async_nats::Client>,
    link_tx: Arc<watch::Sender<LinkStatus>>,
    flush_timeout: Duration,
}

#[async_trait]
impl Connection for NatsConnection {
    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link_tx.subscribe()
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn MessageSource>, TransportError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| TransportError::Subscribe("connection is closed".to_string()))?;
        let context = jetstream::new(client);

        let stream_name = stream_for_subject(&context, &request.subject).await?;
        let stream = context
            .get_stream(stream_name.as_str())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let config = consumer_config(request)?;
        let consumer: PullConsumer = match request.deliver_start {
            DeliverStart::ByStartTime(_) => {
                // The deliver policy of an existing durable cannot be changed in place.
                if stream.delete_consumer(request.durable.as_str()).await.is_ok() {
                    tracing::info!(durable = %request.durable, "Recreating durable consumer at start time");
                }
                stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| TransportError::Subscribe(e.to_string()))?
            }
            DeliverStart::Resume => stream
                .get_or_create_consumer(request.durable.as_str(), config)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?,
        };

        tracing::debug!(
            stream = %stream_name,
            durable = %request.durable,
            "Pull consumer ready"
        );

        Ok(Box::new(NatsMessageSource {
            consumer: Some(consumer),
            idle_wait: request.idle_wait,
            redelivery_delay: request.redelivery_delay,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let link = self.link_tx.send_replace(LinkStatus::Down);

        // Dropping the client closes the socket; flushing first pushes out pending acks.
        let Some(budget) = close_flush_timeout(link, self.flush_timeout) else {
            tracing::debug!("Link already down, closing without flush");
            return Ok(());
        };
        match timeout(budget, client.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Close(e.to_string())),
            Err(_) => Err(TransportError::Close(format!(
                "flush timed out after {budget:?}"
            ))),
        }
    }
}

/// How long closing may spend flushing. A dropped link cannot flush at all.
fn close_flush_timeout(link: LinkStatus, connect_timeout: Duration) -> Option<Duration> {
    match link {
        LinkStatus::Down => None,
        LinkStatus::Up => Some(connect_timeout.min(CLOSE_FLUSH_TIMEOUT)),
    }
}

/// One page of the JetStream `STREAM.NAMES` API.
#[derive(Debug, Deserialize)]
struct StreamNamesPage {
    streams: Option<Vec<String>>,
}

/// Name of the stream that captures `subject`.
async fn stream_for_subject(
    context: &jetstream::Context,
    subject: &str,
) -> Result<String, TransportError> {
    let response: Response<StreamNamesPage> = context
        .request("STREAM.NAMES", &serde_json::json!({ "subject": subject }))
        .await
        .map_err(|e| {
            TransportError::Subscribe(format!("stream lookup for '{subject}' failed: {e}"))
        })?;
    first_stream(subject, response)
}

fn first_stream(
    subject: &str,
    response: Response<StreamNamesPage>,
) -> Result<String, TransportError> {
    match response {
        Response::Err { error } => Err(TransportError::Subscribe(format!(
            "stream lookup for '{subject}' failed: {error}"
        ))),
        Response::Ok(page) => page
            .streams
            .and_then(|names| names.into_iter().next())
            .ok_or_else(|| {
                TransportError::Subscribe(format!("no stream found for subject '{subject}'"))
            }),
    }
}

fn consumer_config(request: &SubscriptionRequest) -> Result<pull::Config, TransportError> {
    let deliver_policy = match request.deliver_start {
        DeliverStart::Resume => DeliverPolicy::All,
        DeliverStart::ByStartTime(start) => DeliverPolicy::ByStartTime {
            start_time: time::OffsetDateTime::from_unix_timestamp(start.timestamp())
                .map_err(|e| TransportError::Subscribe(format!("invalid start time: {e}")))?,
        },
    };

    Ok(pull::Config {
        durable_name: Some(request.durable.clone()),
        filter_subject: request.filter_subject.clone(),
        deliver_policy,
        ack_policy: AckPolicy::Explicit,
        max_ack_pending: 1,
        max_deliver: request.max_deliver.map(i64::from).unwrap_or(-1),
        ..Default::default()
    })
}

/// Pulls from one durable consumer, a single message per request.
pub struct NatsMessageSource {
    consumer: Option<PullConsumer>,
    idle_wait: Duration,
    redelivery_delay: Duration,
}

#[async_trait]
impl MessageSource for NatsMessageSource {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Err(TransportError::ConnectionLost("unsubscribed".to_string()));
        };

        // A fresh request per call: the next message is only asked for once the previous
        // one has been resolved.
        let mut batch = consumer
            .batch()
            .max_messages(1)
            .expires(self.idle_wait)
            .messages()
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

        let message = match timeout(self.idle_wait + PULL_GRACE, batch.next()).await {
            Err(_) | Ok(None) => return Ok(None),
            Ok(Some(Err(e))) => return Err(TransportError::ConnectionLost(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };

        let (stream_sequence, published, delivery_count) = match message.info() {
            Ok(info) => (
                Some(info.stream_sequence),
                DateTime::<Utc>::from_timestamp(
                    info.published.unix_timestamp(),
                    info.published.nanosecond(),
                ),
                u64::try_from(info.delivered).ok(),
            ),
            Err(e) => {
                tracing::debug!(error = %e, "Message carries no JetStream metadata");
                (None, None, None)
            }
        };

        Ok(Some(Delivery {
            subject: message.subject.to_string(),
            payload: message.payload.clone(),
            stream_sequence,
            published,
            delivery_count,
            token: ResolutionToken::new(Box::new(NatsAck {
                message,
                redelivery_delay: self.redelivery_delay,
            })),
        }))
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        // The durable consumer keeps its position on the server.
        self.consumer.take();
        Ok(())
    }
}

struct NatsAck {
    message: jetstream::Message,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.message
            .ack()
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nak(self: Box<Self>) -> Result<(), TransportError> {
        self.message
            .ack_with(AckKind::Nak(Some(self.redelivery_delay)))
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
