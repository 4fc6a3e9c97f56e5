//! # smile-consumer
//!
//! A resilient, long-running consumer for the SMILE event stream on NATS JetStream.
//!
//! The crate attaches a durable, filtered, explicit-ack subscription to a JetStream
//! stream and feeds every message, decoded as JSON, to a user-supplied handler one at a
//! time. Successful handling acknowledges the message; a decode failure, a handler error or
//! a handler panic negatively acknowledges it so the server redelivers it.
//!
//! The runtime survives broker restarts: dropped connections are re-established at a fixed
//! delay up to a configurable budget, and the durable subscription is recreated so delivery
//! resumes where it left off. SIGINT and SIGTERM stop the runtime gracefully: the in-flight
//! message finishes, then the subscription is removed, then the connection is closed.
//!
//! ## Layout
//!
//! - [`config`]: settings parsing and validation
//! - [`connection`]: connection state machine and reconnect policy
//! - [`subscription`]: durable subscription lifecycle
//! - [`dispatch`]: serial decode, handle, ack/nak loop
//! - [`shutdown`]: signal handling and ordered teardown
//! - [`runtime`]: the top-level [`ConsumerRuntime`]
//! - [`transport`]: the seam to the pub/sub client; [`nats`] implements it

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod envelope;
mod error;
pub mod handler;
#[cfg(feature = "nats")]
pub mod nats;
pub mod runtime;
pub mod shutdown;
pub mod subscription;
pub mod transport;
mod types;

pub use config::{parse_start_date, ClientConfig, ClientConfigBuilder, ReconnectPolicy, Settings};
pub use dispatch::DispatchStats;
pub use envelope::{Acknowledger, Delivery, MessageEnvelope, Resolution, ResolutionToken};
pub use error::*;
pub use handler::{HandlerRegistry, LoggingHandler, MessageHandler, DEFAULT_HANDLER};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use runtime::{ConsumerRuntime, RunSummary};
pub use shutdown::ShutdownSignal;
pub use transport::{
    ConnectOptions, Connection, Credentials, LinkStatus, MessageSource, SubscriptionRequest,
    Transport,
};
pub use types::*;
