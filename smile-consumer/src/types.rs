//! Core types for the smile-consumer crate.

use std::fmt;

/// Lifecycle of the transport connection.
///
/// Only the [`ConnectionManager`](crate::connection::ConnectionManager) moves between
/// states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection has been attempted yet
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// A live connection is available
    Connected,
    /// The connection dropped or an attempt failed; retrying
    Reconnecting,
    /// Shut down; no further transitions
    Closed,
}

impl ConnectionState {
    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Reconnecting) => true,
            (Connected, Reconnecting) => true,
            (Reconnecting, Connected) | (Reconnecting, Reconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Upper bound on consecutive failed connection attempts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MaxAttempts {
    /// Retry forever
    Unlimited,
    /// Give up after this many consecutive failures
    Limited(u32),
}

impl MaxAttempts {
    /// Interpret the `-1` sentinel used by the settings file.
    pub fn from_setting(value: i64) -> Option<Self> {
        match value {
            -1 => Some(MaxAttempts::Unlimited),
            n if n > 0 => u32::try_from(n).ok().map(MaxAttempts::Limited),
            _ => None,
        }
    }

    /// Whether `failures` consecutive failures use up the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        match self {
            MaxAttempts::Unlimited => false,
            MaxAttempts::Limited(max) => failures >= *max,
        }
    }
}

impl fmt::Display for MaxAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxAttempts::Unlimited => f.write_str("unlimited"),
            MaxAttempts::Limited(n) => write!(f, "{n}"),
        }
    }
}

/// Where delivery starts for a durable consumer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliverStart {
    /// Resume from the durable consumer's persisted position, or the beginning of the
    /// stream for a new durable
    Resume,
    /// Replay from the first message published at or after this instant
    ByStartTime(chrono::DateTime<chrono::Utc>),
}

/// Why the dispatch loop returned.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// Shutdown was requested and the loop drained
    Shutdown,
    /// The connection or subscription dropped; reconnect and resubscribe
    ConnectionLost(String),
}
