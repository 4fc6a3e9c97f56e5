//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns the transport connection and the [`ConnectionState`]
//! machine. It is the only component that opens, replaces or closes connections:
//!
//! - [`establish`](ConnectionManager::establish) connects, retrying at a fixed delay
//!   until it succeeds, the reconnect budget is exhausted, or shutdown is requested
//! - [`connection_lost`](ConnectionManager::connection_lost) records a dropped link and
//!   moves to `Reconnecting`
//! - [`close`](ConnectionManager::close) is the only way into the terminal `Closed` state
//!
//! Every state transition is logged and published on a watch channel.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::ReconnectPolicy;
use crate::error::{ConnectionError, ConsumerError, TransportError};
use crate::shutdown::ShutdownSignal;
use crate::transport::{ConnectOptions, Connection, LinkStatus, Transport};
use crate::types::ConnectionState;

/// Owner of the transport connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    policy: ReconnectPolicy,
    connection: Option<Box<dyn Connection>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Consecutive failures since the last healthy subscription
    failures: u32,
    /// Wait before the next attempt (set after any failure or drop)
    pending_delay: bool,
    ever_connected: bool,
    reconnects: u64,
    last_error: Option<TransportError>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectOptions, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            options,
            policy,
            connection: None,
            state_tx,
            failures: 0,
            pending_delay: false,
            ever_connected: false,
            reconnects: 0,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of successful reconnects after the first connection.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Most recent connect or link failure, cleared once healthy.
    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<&dyn Connection> {
        self.connection.as_deref()
    }

    /// Link status of the live connection.
    pub fn link_status(&self) -> Option<watch::Receiver<LinkStatus>> {
        self.connection.as_ref().map(|c| c.link_status())
    }

    /// Connect, retrying under the reconnect policy.
    ///
    /// Returns `Ok(true)` once a connection is live, `Ok(false)` if shutdown was
    /// requested while waiting, and [`ConsumerError::ConnectionExhausted`] when a finite
    /// budget runs out.
    pub async fn establish(&mut self, shutdown: &ShutdownSignal) -> Result<bool, ConsumerError> {
        if self.connection.is_some() {
            return Ok(true);
        }
        if self.state() == ConnectionState::Closed {
            return Ok(false);
        }

        loop {
            if shutdown.is_requested() {
                return Ok(false);
            }

            if self.pending_delay {
                tracing::debug!(
                    delay = ?self.policy.delay,
                    attempt = self.failures + 1,
                    "Waiting before next connection attempt"
                );
                if !shutdown.sleep(self.policy.delay).await {
                    return Ok(false);
                }
            }

            if self.state() == ConnectionState::Disconnected {
                self.transition(ConnectionState::Connecting);
            }

            match self.attempt().await {
                Ok(connection) => {
                    self.connection = Some(connection);
                    self.pending_delay = false;
                    self.transition(ConnectionState::Connected);
                    if self.ever_connected {
                        self.reconnects += 1;
                    }
                    self.ever_connected = true;
                    tracing::info!(url = %self.options.url, "Connected to NATS at {}", self.options.url);
                    return Ok(true);
                }
                Err(source) => {
                    self.record_failure(source)?;
                }
            }
        }
    }

    /// Reset the consecutive-failure counter once the connection is proven usable.
    pub fn mark_healthy(&mut self) {
        if self.failures > 0 {
            tracing::debug!(failures = self.failures, "Connection healthy, resetting failure count");
        }
        self.failures = 0;
        self.last_error = None;
    }

    /// Record that the live connection (or the subscription on it) dropped.
    ///
    /// The dead connection is closed best-effort and the manager moves to `Reconnecting`.
    /// Returns [`ConsumerError::ConnectionExhausted`] if `counts_as_failure` pushes the
    /// failure count over a finite budget.
    pub async fn connection_lost(
        &mut self,
        reason: TransportError,
        counts_as_failure: bool,
    ) -> Result<(), ConsumerError> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }

        tracing::warn!(url = %self.options.url, error = %reason, "Disconnected from NATS");

        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Closing dropped connection failed");
            }
        }

        if counts_as_failure {
            self.record_failure(reason)
        } else {
            self.transition(ConnectionState::Reconnecting);
            self.last_error = Some(reason);
            Ok(())
        }
    }

    /// Close the connection and enter the terminal `Closed` state. Idempotent.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }

        let result = match self.connection.take() {
            Some(mut connection) => connection.close().await,
            None => Ok(()),
        };

        self.transition(ConnectionState::Closed);
        match &result {
            Ok(()) => tracing::info!("Disconnected from NATS"),
            Err(e) => tracing::error!(error = %e, "Error during disconnect"),
        }
        result
    }

    async fn attempt(&self) -> Result<Box<dyn Connection>, TransportError> {
        let limit = self.options.connect_timeout;
        match timeout(limit, self.transport.connect(&self.options)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    fn record_failure(&mut self, source: TransportError) -> Result<(), ConsumerError> {
        self.failures += 1;
        self.pending_delay = true;

        let error = ConnectionError {
            url: self.options.url.clone(),
            attempt: self.failures,
            source,
        };
        tracing::warn!(
            attempt = self.failures,
            max_attempts = %self.policy.max_attempts,
            "{}",
            error
        );

        if self.policy.max_attempts.is_exhausted(self.failures) {
            self.transition(ConnectionState::Closed);
            tracing::error!(
                attempts = self.failures,
                "Giving up on NATS at {} after {} consecutive failures",
                self.options.url,
                self.failures
            );
            return Err(ConsumerError::ConnectionExhausted {
                attempts: self.failures,
                last_error: error.source.to_string(),
            });
        }

        self.last_error = Some(error.source);
        self.transition(ConnectionState::Reconnecting);
        Ok(())
    }

    fn transition(&self, next: ConnectionState) {
        let current = self.state();
        if current == next && next != ConnectionState::Reconnecting {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "Ignoring invalid connection state transition");
            return;
        }
        tracing::info!(from = %current, to = %next, "Connection state changed");
        self.state_tx.send_replace(next);
    }
}
