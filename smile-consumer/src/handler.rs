//! Handler contract and the named-handler registry used to resolve the `CALLBACK` setting.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::envelope::MessageEnvelope;
use crate::error::HandlerError;

/// Name under which [`LoggingHandler`] is registered.
pub const DEFAULT_HANDLER: &str = "default";

/// User code invoked once per decoded message.
///
/// The runtime never calls a handler concurrently with itself. Returning `Ok(())`
/// acknowledges the message; returning an error (or panicking) negatively acknowledges it.
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&MessageEnvelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// Handler that logs every message and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        tracing::info!(
            subject = %envelope.subject,
            "Received a message on '{}': {}",
            envelope.subject,
            envelope.data
        );
        Ok(())
    }
}

/// Handlers addressable by name, resolved once at startup.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Registry containing only the [`LoggingHandler`] under [`DEFAULT_HANDLER`].
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(DEFAULT_HANDLER, LoggingHandler);
        registry
    }

    /// Register (or replace) a handler under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler(
        mut self,
        name: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        self.register(name, handler);
        self
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
