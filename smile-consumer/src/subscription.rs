//! Durable subscription ownership.
//!
//! A [`SubscriptionController`] holds at most one [`SubscriptionHandle`] at a time. The
//! configured start time anchors only the first successful subscription; later
//! subscriptions (after a reconnect) resume from the durable consumer's own position.

use chrono::{DateTime, Utc};

use crate::error::SubscribeError;
use crate::transport::{Connection, MessageSource, SubscriptionRequest};
use crate::types::DeliverStart;

/// A live durable subscription.
pub struct SubscriptionHandle {
    filter_subject: String,
    durable: String,
    deliver_start: DeliverStart,
    source: Box<dyn MessageSource>,
}

impl SubscriptionHandle {
    pub fn filter_subject(&self) -> &str {
        &self.filter_subject
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }

    /// Where this subscription started delivering from.
    pub fn deliver_start(&self) -> DeliverStart {
        self.deliver_start
    }

    pub(crate) fn source_mut(&mut self) -> &mut dyn MessageSource {
        self.source.as_mut()
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("filter_subject", &self.filter_subject)
            .field("durable", &self.durable)
            .field("deliver_start", &self.deliver_start)
            .finish_non_exhaustive()
    }
}

/// Creates, replaces and tears down the durable subscription.
pub struct SubscriptionController {
    template: SubscriptionRequest,
    /// Start-time anchor, consumed by the first successful subscription
    anchor: Option<DateTime<Utc>>,
    handle: Option<SubscriptionHandle>,
    created: u64,
}

impl SubscriptionController {
    pub fn new(template: SubscriptionRequest, start_time: Option<DateTime<Utc>>) -> Self {
        Self {
            template,
            anchor: start_time,
            handle: None,
            created: 0,
        }
    }

    /// The live subscription, if any.
    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut SubscriptionHandle> {
        self.handle.as_mut()
    }

    /// Number of subscriptions created so far.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Start-time anchor still waiting to be applied.
    pub fn pending_anchor(&self) -> Option<DateTime<Utc>> {
        self.anchor
    }

    /// Request the next subscription would use.
    pub fn next_request(&self) -> SubscriptionRequest {
        let deliver_start = match self.anchor {
            Some(start) => DeliverStart::ByStartTime(start),
            None => DeliverStart::Resume,
        };
        SubscriptionRequest {
            deliver_start,
            ..self.template.clone()
        }
    }

    /// Create the durable subscription on `connection`, replacing any previous handle.
    pub async fn subscribe(&mut self, connection: &dyn Connection) -> Result<(), SubscribeError> {
        // A handle surviving at this point belongs to a dead connection.
        self.discard();

        let request = self.next_request();
        match connection.subscribe(&request).await {
            Ok(source) => {
                tracing::info!(
                    filter_subject = %request.filter_subject,
                    durable = %request.durable,
                    deliver_start = ?request.deliver_start,
                    "Subscribed to '{}' as durable '{}'",
                    request.filter_subject,
                    request.durable
                );
                self.anchor = None;
                self.created += 1;
                self.handle = Some(SubscriptionHandle {
                    filter_subject: request.filter_subject,
                    durable: request.durable,
                    deliver_start: request.deliver_start,
                    source,
                });
                Ok(())
            }
            Err(source) => Err(SubscribeError {
                filter_subject: request.filter_subject,
                durable: request.durable,
                source,
            }),
        }
    }

    /// Forget the handle without talking to the server.
    ///
    /// Used when the connection carrying it is already gone.
    pub fn discard(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(durable = %handle.durable, "Discarding subscription of dropped connection");
        }
    }

    /// Stop the subscription. Idempotent; errors are logged.
    pub async fn unsubscribe(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match handle.source.unsubscribe().await {
            Ok(()) => tracing::info!(durable = %handle.durable, "Unsubscribed from '{}'", handle.filter_subject),
            Err(e) => tracing::error!(
                durable = %handle.durable,
                error = %e,
                "Error during unsubscribe"
            ),
        }
    }
}
