//! The serial dispatch loop.
//!
//! Exactly one delivery is processed at a time: pull, decode, run the handler, resolve.
//! The loop only stops between deliveries, never while a handler is running.

use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::envelope::{Delivery, MessageEnvelope, Resolution};
use crate::error::HandlerError;
use crate::handler::MessageHandler;
use crate::shutdown::ShutdownSignal;
use crate::transport::{LinkStatus, MessageSource};
use crate::types::DispatchOutcome;

/// Counters kept across reconnects.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    /// Acks or naks the transport failed to send
    pub resolve_failures: u64,
}

/// Pulls deliveries and feeds them to the handler one by one.
pub struct DispatchLoop {
    handler: Arc<dyn MessageHandler>,
    shutdown: ShutdownSignal,
    in_flight: Arc<AtomicBool>,
    stats: DispatchStats,
}

impl DispatchLoop {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownSignal,
        in_flight: Arc<AtomicBool>,
    ) -> Self {
        Self {
            handler,
            shutdown,
            in_flight,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Run until shutdown is requested or the subscription stops delivering.
    ///
    /// `link` is the connection's link status; a `Down` observed while waiting for a
    /// delivery ends the loop with [`DispatchOutcome::ConnectionLost`].
    pub async fn run(
        &mut self,
        source: &mut dyn MessageSource,
        mut link: Option<watch::Receiver<LinkStatus>>,
    ) -> DispatchOutcome {
        tracing::info!("Starting consumer...");

        loop {
            if self.shutdown.is_requested() {
                return DispatchOutcome::Shutdown;
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.requested() => return DispatchOutcome::Shutdown,
                reason = link_down(&mut link) => return DispatchOutcome::ConnectionLost(reason),
                next = source.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                    // A source that never waits (a rejected message redelivered at once)
                    // must not starve the other tasks on this worker.
                    tokio::task::yield_now().await;
                }
                Ok(None) => continue,
                Err(e) => return DispatchOutcome::ConnectionLost(e.to_string()),
            }
        }
    }

    /// Decode, handle and resolve a single delivery.
    pub async fn process(&mut self, delivery: Delivery) -> Resolution {
        self.in_flight.store(true, Ordering::SeqCst);
        self.stats.delivered += 1;

        let (decoded, token) = delivery.into_parts();
        let resolution = match decoded {
            Err(e) => {
                self.stats.decode_failures += 1;
                tracing::error!(subject = %e.subject, error = %e.source, "{}", e);
                Resolution::from_outcome(false, false)
            }
            Ok(envelope) => {
                let subject = envelope.subject.clone();
                let sequence = envelope.stream_sequence;
                let outcome = self.invoke(envelope).await;
                if let Err(e) = &outcome {
                    self.stats.handler_failures += 1;
                    tracing::error!(
                        subject = %subject,
                        stream_sequence = ?sequence,
                        error = %e,
                        "Error processing message"
                    );
                }
                Resolution::from_outcome(true, outcome.is_ok())
            }
        };

        match token.resolve(resolution).await {
            Ok(()) => match resolution {
                Resolution::Ack => self.stats.acked += 1,
                Resolution::Nak => self.stats.nacked += 1,
            },
            Err(e) => {
                self.stats.resolve_failures += 1;
                tracing::warn!(?resolution, error = %e, "Failed to resolve message");
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
        resolution
    }

    async fn invoke(&self, envelope: MessageEnvelope) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        match tokio::task::spawn_blocking(move || handler.handle(&envelope)).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(HandlerError::Panicked(panic_message(join_error.into_panic())))
            }
            Err(join_error) => Err(HandlerError::Panicked(join_error.to_string())),
        }
    }
}

/// Resolves when the link goes down, or never if there is no link to watch.
async fn link_down(link: &mut Option<watch::Receiver<LinkStatus>>) -> String {
    match link {
        Some(rx) => match rx.wait_for(|status| *status == LinkStatus::Down).await {
            Ok(_) => "connection dropped".to_string(),
            Err(_) => "connection closed".to_string(),
        },
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
