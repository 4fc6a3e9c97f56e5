//! Message envelope handed to handlers, and the one-shot resolution token the runtime
//! keeps for each delivery.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::error::{DecodeError, TransportError};

/// One decoded message, as seen by a [`MessageHandler`](crate::MessageHandler).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Subject the message was published on
    pub subject: String,
    /// Decoded JSON payload
    pub data: Value,
    /// Raw payload bytes
    pub payload: Bytes,
    /// Stream sequence number, when the transport provides one
    pub stream_sequence: Option<u64>,
    /// Publish timestamp, when the transport provides one
    pub published: Option<DateTime<Utc>>,
    /// Number of times the server has delivered this message, including this one
    pub delivery_count: Option<u64>,
}

impl MessageEnvelope {
    /// Decode a raw payload as JSON.
    pub fn decode(
        subject: impl Into<String>,
        payload: Bytes,
    ) -> Result<Self, DecodeError> {
        let subject = subject.into();
        match serde_json::from_slice::<Value>(&payload) {
            Ok(data) => Ok(Self {
                subject,
                data,
                payload,
                stream_sequence: None,
                published: None,
                delivery_count: None,
            }),
            Err(source) => Err(DecodeError { subject, source }),
        }
    }
}

impl fmt::Display for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmileMessage: {} {}", self.subject, self.data)
    }
}

/// How a delivery is resolved towards the server.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Resolution {
    /// Processed; the server may discard it
    Ack,
    /// Not processed; the server should redeliver it
    Nak,
}

impl Resolution {
    /// Resolution as a total function of decode and handler success.
    pub fn from_outcome(decoded: bool, handled: bool) -> Self {
        if decoded && handled {
            Resolution::Ack
        } else {
            Resolution::Nak
        }
    }
}

/// Transport-side acknowledgment for one delivery.
///
/// Both methods consume the boxed token, so a delivery can be resolved at most once.
#[async_trait]
pub trait Acknowledger: Send {
    /// Positively acknowledge the delivery.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Negatively acknowledge the delivery for redelivery.
    async fn nak(self: Box<Self>) -> Result<(), TransportError>;
}

/// Opaque one-shot resolution token owned by the dispatch loop.
pub struct ResolutionToken {
    inner: Box<dyn Acknowledger>,
}

impl ResolutionToken {
    /// Wrap a transport acknowledger.
    pub fn new(inner: Box<dyn Acknowledger>) -> Self {
        Self { inner }
    }

    /// Resolve the delivery, consuming the token.
    pub async fn resolve(self, resolution: Resolution) -> Result<(), TransportError> {
        match resolution {
            Resolution::Ack => self.inner.ack().await,
            Resolution::Nak => self.inner.nak().await,
        }
    }
}

impl fmt::Debug for ResolutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionToken").finish_non_exhaustive()
    }
}

/// A raw delivery pulled from the transport, before decoding.
#[derive(Debug)]
pub struct Delivery {
    /// Subject the message was published on
    pub subject: String,
    /// Raw payload bytes
    pub payload: Bytes,
    /// Stream sequence number, when known
    pub stream_sequence: Option<u64>,
    /// Publish timestamp, when known
    pub published: Option<DateTime<Utc>>,
    /// Server-side delivery count, when known
    pub delivery_count: Option<u64>,
    /// One-shot ack/nak handle
    pub token: ResolutionToken,
}

impl Delivery {
    /// Split the delivery into its decoded envelope (or decode failure) and its token.
    pub fn into_parts(self) -> (Result<MessageEnvelope, DecodeError>, ResolutionToken) {
        let Delivery {
            subject,
            payload,
            stream_sequence,
            published,
            delivery_count,
            token,
        } = self;

        let envelope = MessageEnvelope::decode(subject, payload).map(|mut envelope| {
            envelope.stream_sequence = stream_sequence;
            envelope.published = published;
            envelope.delivery_count = delivery_count;
            envelope
        });

        (envelope, token)
    }
}
