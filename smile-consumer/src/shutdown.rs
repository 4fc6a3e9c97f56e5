//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] is the shutdown-requested flag shared between the signal-handling
//! context and the dispatch loop. [`ShutdownCoordinator`] turns OS signals into a request,
//! waits (bounded) for the dispatch loop to drain, and then tears down the subscription
//! and the connection in that order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::connection::ConnectionManager;
use crate::subscription::SubscriptionController;

/// Cloneable, idempotent shutdown flag.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` only for the first request.
    pub fn request(&self) -> bool {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        })
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.requested() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Count of termination signals received by this process.
static PROCESS_SIGNALS: OnceLock<watch::Sender<u64>> = OnceLock::new();

/// Subscribe to process termination signals.
///
/// The OS handlers for SIGINT and SIGTERM are registered once per process, by the first
/// caller, on a dedicated thread with its own runtime, so the listener outlives the runtime
/// of whichever consumer started it. The first call blocks until the handlers are in place.
fn process_signals() -> watch::Receiver<u64> {
    PROCESS_SIGNALS
        .get_or_init(|| {
            let (tx, _) = watch::channel(0u64);
            spawn_signal_thread(tx.clone());
            tx
        })
        .subscribe()
}

fn spawn_signal_thread(tx: watch::Sender<u64>) {
    let (ready_tx, ready_rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("smile-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start the signal listener");
                    return;
                }
            };
            runtime.block_on(listen_for_os_signals(tx, ready_tx));
        });

    match spawned {
        Ok(_) => {
            // Fails only when the listener gave up, which it has already logged.
            let _ = ready_rx.recv();
        }
        Err(e) => tracing::error!(error = %e, "Failed to spawn the signal listener thread"),
    }
}

#[cfg(unix)]
async fn listen_for_os_signals(tx: watch::Sender<u64>, ready: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to register signal handlers");
                return;
            }
        };
    let _ = ready.send(());

    loop {
        let name = tokio::select! {
            received = interrupt.recv() => match received {
                Some(()) => "SIGINT",
                None => break,
            },
            received = terminate.recv() => match received {
                Some(()) => "SIGTERM",
                None => break,
            },
        };
        tracing::info!(signal = name, "Received signal {}", name);
        tx.send_modify(|count| *count += 1);
    }
}

#[cfg(not(unix))]
async fn listen_for_os_signals(tx: watch::Sender<u64>, ready: mpsc::Sender<()>) {
    let _ = ready.send(());
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!(signal = "ctrl-c", "Received Ctrl+C");
        tx.send_modify(|count| *count += 1);
    }
}

/// Orders the drain-unsubscribe-disconnect sequence.
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    drain_timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(signal: ShutdownSignal, drain_timeout: Duration) -> Self {
        Self {
            signal,
            drain_timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Marker the dispatch loop raises while a message is being processed.
    pub fn in_flight_marker(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_flight)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Forward process signals into this coordinator's shutdown flag.
    ///
    /// The first signal requests shutdown; any later signal is logged and ignored.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        // A fresh receiver has already seen the current count, so only signals received
        // from now on count for this runtime.
        let mut signals = process_signals();
        let signal = self.signal.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            while signals.changed().await.is_ok() {
                signals.borrow_and_update();
                if signal.request() {
                    tracing::info!(
                        in_flight = in_flight.load(Ordering::SeqCst),
                        "Initiating shutdown..."
                    );
                } else {
                    tracing::info!("Shutdown already in progress, ignoring signal");
                }
            }
        })
    }

    /// Drive `dispatch` to completion, but once shutdown is requested give it at most the
    /// drain timeout. Returns `None` if the drain timed out.
    pub async fn drain<F>(&self, dispatch: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::pin!(dispatch);

        tokio::select! {
            output = &mut dispatch => Some(output),
            _ = self.signal.requested() => {
                tracing::info!("Shutdown event received, stopping consumer...");
                match timeout(self.drain_timeout, &mut dispatch).await {
                    Ok(output) => Some(output),
                    Err(_) => {
                        tracing::warn!(
                            timeout = ?self.drain_timeout,
                            in_flight = self.is_in_flight(),
                            "Consumer did not drain in time, tearing down anyway"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Unsubscribe, then close the connection. Errors are logged, never raised.
    pub async fn teardown(
        &self,
        subscriptions: &mut SubscriptionController,
        connections: &mut ConnectionManager,
    ) {
        subscriptions.unsubscribe().await;
        if let Err(e) = connections.close().await {
            tracing::debug!(error = %e, "Connection close reported an error");
        }
    }
}
