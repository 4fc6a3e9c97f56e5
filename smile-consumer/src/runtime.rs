//! The consumer runtime: connect, subscribe, dispatch, and recover until shutdown.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::{DispatchLoop, DispatchStats};
use crate::error::{ConsumerError, Result, TransportError};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::subscription::SubscriptionController;
use crate::transport::Transport;
use crate::types::{ConnectionState, DeliverStart, DispatchOutcome};

/// What a finished run did.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct RunSummary {
    pub stats: DispatchStats,
    /// Successful reconnects after the first connection
    pub reconnects: u64,
    /// Subscriptions created, including resubscriptions
    pub subscriptions: u64,
}

/// Owns all runtime state: connection, subscription, shutdown flag and in-flight marker.
///
/// # Example
///
/// ```rust,no_run
/// use smile_consumer::{ClientConfig, ConsumerRuntime, HandlerRegistry, NatsTransport, Settings};
/// use std::sync::Arc;
///
/// # async fn example(settings: Settings) -> smile_consumer::Result<()> {
/// let config = ClientConfig::from_settings(&settings, &HandlerRegistry::new())?;
/// let summary = ConsumerRuntime::new(config, Arc::new(NatsTransport::new()))
///     .run()
///     .await?;
/// println!("acked {} messages", summary.stats.acked);
/// # Ok(())
/// # }
/// ```
pub struct ConsumerRuntime {
    config: ClientConfig,
    connections: ConnectionManager,
    subscriptions: SubscriptionController,
    dispatch: DispatchLoop,
    coordinator: ShutdownCoordinator,
}

impl ConsumerRuntime {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let signal = ShutdownSignal::new();
        let coordinator = ShutdownCoordinator::new(signal.clone(), config.shutdown_timeout());
        let connections =
            ConnectionManager::new(transport, config.connect_options(), config.reconnect());
        let subscriptions = SubscriptionController::new(
            config.subscription_request(DeliverStart::Resume),
            config.start_time(),
        );
        let dispatch = DispatchLoop::new(config.handler(), signal, coordinator.in_flight_marker());

        Self {
            config,
            connections,
            subscriptions,
            dispatch,
            coordinator,
        }
    }

    /// Handle for requesting shutdown from outside the runtime.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.coordinator.signal().clone()
    }

    /// Observe connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connections.watch_state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run until shutdown, or until a finite reconnect budget is exhausted.
    ///
    /// Teardown (unsubscribe, then close) always runs before this returns.
    pub async fn run(self) -> Result<RunSummary> {
        let Self {
            config,
            mut connections,
            mut subscriptions,
            mut dispatch,
            coordinator,
        } = self;

        tracing::info!(
            url = %config.url(),
            filter_subject = %config.filter_subject(),
            durable = %config.durable(),
            start_time = ?config.start_time(),
            "Starting SMILE consumer"
        );

        let signals = config
            .install_signal_handlers()
            .then(|| coordinator.listen_for_signals());

        let consumed = coordinator
            .drain(consume(
                &mut connections,
                &mut subscriptions,
                &mut dispatch,
                coordinator.signal(),
            ))
            .await;

        coordinator.teardown(&mut subscriptions, &mut connections).await;
        if let Some(signals) = signals {
            signals.abort();
        }

        let summary = RunSummary {
            stats: dispatch.stats(),
            reconnects: connections.reconnects(),
            subscriptions: subscriptions.created(),
        };

        match consumed {
            Some(Ok(())) => {
                tracing::info!(
                    acked = summary.stats.acked,
                    nacked = summary.stats.nacked,
                    reconnects = summary.reconnects,
                    "Consumer stopped"
                );
                Ok(summary)
            }
            Some(Err(e)) => Err(e),
            None => Err(ConsumerError::Shutdown(format!(
                "message processing did not finish within {:?}",
                config.shutdown_timeout()
            ))),
        }
    }
}

async fn consume(
    connections: &mut ConnectionManager,
    subscriptions: &mut SubscriptionController,
    dispatch: &mut DispatchLoop,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    loop {
        if !connections.establish(shutdown).await? {
            return Ok(());
        }

        let subscribed = match connections.connection() {
            Some(connection) => subscriptions.subscribe(connection).await,
            None => continue,
        };
        if let Err(e) = subscribed {
            tracing::error!(
                filter_subject = %e.filter_subject,
                durable = %e.durable,
                error = %e.source,
                "{}",
                e
            );
            connections.connection_lost(e.source, true).await?;
            continue;
        }
        connections.mark_healthy();

        let link = connections.link_status();
        let Some(handle) = subscriptions.handle_mut() else {
            continue;
        };

        match dispatch.run(handle.source_mut(), link).await {
            DispatchOutcome::Shutdown => return Ok(()),
            DispatchOutcome::ConnectionLost(reason) => {
                subscriptions.discard();
                connections
                    .connection_lost(TransportError::ConnectionLost(reason), false)
                    .await?;
            }
        }
    }
}
