//! Error types for the smile-consumer crate.

/// Top-level errors returned by [`ConsumerRuntime::run`](crate::ConsumerRuntime::run).
///
/// Only [`ConsumerError::Configuration`] and [`ConsumerError::ConnectionExhausted`] are
/// fatal conditions of a healthy deployment. Everything else is recovered inside the
/// runtime and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The configuration was rejected before the first connection attempt
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A finite reconnect budget was used up without establishing a connection
    #[error("Connection attempts exhausted after {attempts} consecutive failures: {last_error}")]
    ConnectionExhausted {
        /// Number of consecutive failed attempts
        attempts: u32,
        /// The error reported by the final attempt
        last_error: String,
    },

    /// Teardown could not be completed cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl ConsumerError {
    /// Process exit code used by the command line tool for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConsumerError::Configuration(_) => 2,
            ConsumerError::ConnectionExhausted { .. } => 3,
            ConsumerError::Shutdown(_) => 1,
        }
    }
}

/// Errors raised while validating settings into a [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// A required key is absent or empty
    #[error("Missing required setting: {0}")]
    MissingKey(String),

    /// A key is present but its value cannot be used
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue {
        /// The offending key
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Credential keys from more than one authentication mode were supplied
    #[error("Conflicting credentials: {0}")]
    ConflictingCredentials(String),

    /// Only part of a credential group was supplied
    #[error("Incomplete credentials: {0}")]
    IncompleteCredentials(String),

    /// The start date does not follow `YYYY-MM-DD`
    #[error("Invalid date format: {0}. Expected YYYY-MM-DD format.")]
    InvalidStartDate(String),

    /// The `CALLBACK` setting names a handler that is not registered
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    /// The connection could not be opened
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The connection attempt exceeded the configured timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server-side consumer or the subscription could not be set up
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The link to the server dropped while in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An acknowledgment could not be delivered to the server
    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    /// Closing the connection or the subscription failed
    #[error("Close failed: {0}")]
    Close(String),
}

/// A single failed connection attempt. Recoverable: the connection manager retries it.
#[derive(Debug, thiserror::Error)]
#[error("Connection attempt {attempt} to {url} failed: {source}")]
pub struct ConnectionError {
    /// Target server URL
    pub url: String,
    /// 1-based count of consecutive failures including this one
    pub attempt: u32,
    /// Underlying transport failure
    #[source]
    pub source: TransportError,
}

/// Failure to establish the durable subscription. Recoverable: retried with the next connection.
#[derive(Debug, thiserror::Error)]
#[error("Subscribe to {filter_subject} as durable {durable} failed: {source}")]
pub struct SubscribeError {
    /// Consumer filter subject
    pub filter_subject: String,
    /// Durable consumer name
    pub durable: String,
    /// Underlying transport failure
    #[source]
    pub source: TransportError,
}

/// A payload that is not valid JSON. The message is negative-acknowledged.
#[derive(Debug, thiserror::Error)]
#[error("Invalid JSON received on {subject}: {source}")]
pub struct DecodeError {
    /// Subject the message arrived on
    pub subject: String,
    /// Parser error
    #[source]
    pub source: serde_json::Error,
}

/// Errors returned by a [`MessageHandler`](crate::MessageHandler).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler rejected the message
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked while processing the message
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Failed`] from any displayable error.
    pub fn failed(error: impl std::fmt::Display) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// Convenience type alias for Results using ConsumerError.
pub type Result<T> = std::result::Result<T, ConsumerError>;
