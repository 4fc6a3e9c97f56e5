//! Transport seam between the runtime and a pub/sub client library.
//!
//! The runtime never talks to a broker directly. It composes three traits:
//!
//! - [`Transport`]: opens connections
//! - [`Connection`]: one live link; reports link status, creates subscriptions, closes
//! - [`MessageSource`]: one durable subscription; yields deliveries one at a time
//!
//! The NATS JetStream implementation lives in [`crate::nats`]. Tests provide an in-memory
//! implementation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use crate::envelope::Delivery;
use crate::error::TransportError;
use crate::types::DeliverStart;

/// Authentication material for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Anonymous connection
    None,
    /// Username and password
    UserPassword {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Mutual TLS with a client certificate
    Tls {
        /// Client certificate (PEM)
        cert_file: PathBuf,
        /// Client private key (PEM)
        key_file: PathBuf,
        /// Optional root CA used to verify the server
        root_ca: Option<PathBuf>,
    },
}

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,
    /// Authentication material
    pub credentials: Credentials,
    /// Upper bound for a single connection attempt
    pub connect_timeout: Duration,
    /// Client name reported to the server
    pub client_name: String,
}

/// Parameters of a durable, filtered, explicit-ack subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Subject used to locate the stream
    pub subject: String,
    /// Consumer filter subject
    pub filter_subject: String,
    /// Durable consumer name
    pub durable: String,
    /// Where delivery begins
    pub deliver_start: DeliverStart,
    /// Server-side cap on deliveries per message (`None` = unlimited)
    pub max_deliver: Option<u32>,
    /// Wait the server applies before redelivering a rejected message
    pub redelivery_delay: Duration,
    /// How long a single pull waits before reporting "no message yet"
    pub idle_wait: Duration,
}

/// Health of a connection as observed by the transport's background work.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkStatus {
    /// The link is usable
    Up,
    /// The link dropped
    Down,
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection. A single attempt; retry policy belongs to the caller.
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live connection to the server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Watch channel tracking the link status.
    ///
    /// Transport background tasks update it; they never invoke the message handler.
    fn link_status(&self) -> watch::Receiver<LinkStatus>;

    /// Create (or bind to) the durable consumer and return its message source.
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn MessageSource>, TransportError>;

    /// Close the connection. Calling it on an already-dropped link must not panic.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Deliveries of one durable subscription, pulled one at a time.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` when nothing arrived within the idle wait, so the caller can
    /// check for shutdown. Returns [`TransportError::ConnectionLost`] when the subscription
    /// can no longer deliver.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// Stop receiving. Must be idempotent.
    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}
