//! Test helpers for driving the runtime against the in-memory broker.

#![allow(dead_code)]

use smile_consumer::{
    ClientConfig, ClientConfigBuilder, ConnectionState, ConsumerRuntime, HandlerError,
    MessageEnvelope, MessageHandler, RunSummary, ShutdownSignal,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::mock_transport::{BrokerEvent, MockBroker};

/// Envelopes seen by a recording handler, in invocation order.
pub type Seen = Arc<Mutex<Vec<MessageEnvelope>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("smile_consumer=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with test-friendly timings: fast reconnects, short idle pulls, and no
/// process signal handlers.
pub fn test_config(handler: Arc<dyn MessageHandler>) -> ClientConfigBuilder {
    ClientConfig::builder(
        "nats://mock:4222",
        "S.*",
        "d1",
        Duration::from_secs(1),
        handler,
    )
    .with_reconnect_delay(Duration::from_millis(20))
    .with_idle_wait(Duration::from_millis(20))
    .with_shutdown_timeout(Duration::from_secs(5))
    .with_signal_handlers(false)
}

/// Handler that records each envelope, runs `behaviour`, then logs `Handled` on the broker.
pub fn recording_handler<F>(broker: &MockBroker, seen: &Seen, behaviour: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&MessageEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let broker = broker.clone();
    let seen = Arc::clone(seen);
    Arc::new(move |envelope: &MessageEnvelope| -> Result<(), HandlerError> {
        seen.lock().unwrap().push(envelope.clone());
        let result = behaviour(envelope);
        if let Some(sequence) = envelope.stream_sequence {
            broker.record(BrokerEvent::Handled(sequence));
        }
        result
    })
}

/// Handler that accepts everything.
pub fn accepting_handler(broker: &MockBroker, seen: &Seen) -> Arc<dyn MessageHandler> {
    recording_handler(broker, seen, |_| Ok(()))
}

/// A runtime running on a background task.
pub struct Running {
    pub shutdown: ShutdownSignal,
    pub state: watch::Receiver<ConnectionState>,
    pub task: JoinHandle<smile_consumer::Result<RunSummary>>,
}

impl Running {
    /// Request shutdown and wait for `run()` to return.
    pub async fn stop(self) -> smile_consumer::Result<RunSummary> {
        self.shutdown.request();
        self.join().await
    }

    pub async fn join(self) -> smile_consumer::Result<RunSummary> {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("runtime did not stop in time")
            .expect("runtime task panicked")
    }

    /// Wait until the connection state equals `state`.
    pub async fn wait_for_state(&mut self, state: ConnectionState, limit: Duration) {
        tokio::time::timeout(limit, self.state.wait_for(|current| *current == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for state {state}"))
            .expect("state channel closed");
    }
}

pub fn start(config: ClientConfig, broker: &MockBroker) -> Running {
    let runtime = ConsumerRuntime::new(config, Arc::new(broker.clone()));
    let shutdown = runtime.shutdown_signal();
    let state = runtime.watch_state();
    Running {
        shutdown,
        state,
        task: tokio::spawn(runtime.run()),
    }
}

/// Poll `condition` every few milliseconds, panicking after `limit`.
pub async fn wait_until(what: &str, limit: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > limit {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
