//! In-memory JetStream stand-in for integration tests.
//!
//! [`MockBroker`] keeps one stream of messages and a cursor per durable consumer. It
//! implements the `Transport` traits so the real runtime can run against it, and exposes
//! controls for the failure modes the runtime has to survive:
//! - refusing the next N connection attempts
//! - dropping the live connection
//! - rejecting subscriptions
//!
//! Every server-visible action is appended to an event log so tests can assert ordering.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use smile_consumer::{
    Acknowledger, ConnectOptions, Connection, DeliverStart, Delivery, LinkStatus, MessageSource,
    ResolutionToken, SubscriptionRequest, Transport, TransportError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// Server-visible action, in the order the broker observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected(u64),
    ConnectRefused,
    Subscribed { durable: String, deliver_start: DeliverStart },
    SubscribeRejected,
    Delivered { sequence: u64, count: u64 },
    Acked(u64),
    Nacked(u64),
    Unsubscribed(String),
    Closed(u64),
    Dropped(u64),
    /// Recorded by test handlers
    Handled(u64),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Bytes,
    published: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DurableConsumer {
    filter_subject: String,
    /// Index into the stream of the next never-delivered message
    cursor: usize,
    /// Nacked or orphaned sequences, delivered before anything new
    redeliver: VecDeque<u64>,
    /// Delivered and unresolved, by sequence, with the connection that holds them
    pending: HashMap<u64, u64>,
    acked: HashSet<u64>,
    deliveries: HashMap<u64, u64>,
    max_deliver: Option<u32>,
}

#[derive(Default)]
struct BrokerState {
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, DurableConsumer>,
    events: Vec<BrokerEvent>,
    refuse_connects: u32,
    reject_subscribes: u32,
    next_connection: u64,
    links: HashMap<u64, Arc<watch::Sender<LinkStatus>>>,
    requests: Vec<SubscriptionRequest>,
}

/// Shared handle to the in-memory broker.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message published now.
    pub fn publish(&self, subject: &str, payload: &[u8]) -> u64 {
        self.publish_at(subject, payload, Utc::now())
    }

    /// Append a message with an explicit publish time.
    pub fn publish_at(&self, subject: &str, payload: &[u8], published: DateTime<Utc>) -> u64 {
        let sequence = {
            let mut state = self.state.lock().unwrap();
            let sequence = state.messages.len() as u64 + 1;
            state.messages.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                payload: Bytes::copy_from_slice(payload),
                published,
            });
            sequence
        };
        self.notify.notify_waiters();
        sequence
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().unwrap().refuse_connects = count;
    }

    /// Reject the next `count` subscription attempts.
    pub fn reject_subscribes(&self, count: u32) {
        self.state.lock().unwrap().reject_subscribes = count;
    }

    /// Drop every live connection, as a broker restart would.
    ///
    /// Deliveries still pending on a dropped connection go back to the redelivery queue.
    pub fn drop_connections(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let dropped: Vec<u64> = state.links.keys().copied().collect();
            for id in &dropped {
                if let Some(link) = state.links.remove(id) {
                    link.send_replace(LinkStatus::Down);
                }
                state.events.push(BrokerEvent::Dropped(*id));
            }
            for consumer in state.consumers.values_mut() {
                let orphaned: Vec<u64> = consumer
                    .pending
                    .iter()
                    .filter(|(_, holder)| dropped.contains(holder))
                    .map(|(sequence, _)| *sequence)
                    .collect();
                for sequence in orphaned {
                    consumer.pending.remove(&sequence);
                    consumer.redeliver.push_back(sequence);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Record an event from test code, e.g. a handler finishing.
    pub fn record(&self, event: BrokerEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.filter_events(|event| match event {
            BrokerEvent::Acked(sequence) => Some(*sequence),
            _ => None,
        })
    }

    pub fn nacked(&self) -> Vec<u64> {
        self.filter_events(|event| match event {
            BrokerEvent::Nacked(sequence) => Some(*sequence),
            _ => None,
        })
    }

    /// Sequences delivered, in delivery order, including redeliveries.
    pub fn delivered(&self) -> Vec<u64> {
        self.filter_events(|event| match event {
            BrokerEvent::Delivered { sequence, .. } => Some(*sequence),
            _ => None,
        })
    }

    pub fn connects(&self) -> usize {
        self.filter_events(|event| match event {
            BrokerEvent::Connected(id) => Some(*id),
            _ => None,
        })
        .len()
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().unwrap().links.len()
    }

    pub fn subscription_requests(&self) -> Vec<SubscriptionRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Position of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&BrokerEvent) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }

    fn filter_events<T>(&self, select: impl Fn(&BrokerEvent) -> Option<T>) -> Vec<T> {
        self.state.lock().unwrap().events.iter().filter_map(select).collect()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            state.events.push(BrokerEvent::ConnectRefused);
            return Err(TransportError::Connect(format!(
                "connection refused: {}",
                options.url
            )));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (link_tx, _) = watch::channel(LinkStatus::Up);
        let link_tx = Arc::new(link_tx);
        state.links.insert(id, Arc::clone(&link_tx));
        state.events.push(BrokerEvent::Connected(id));

        Ok(Box::new(MockConnection {
            broker: self.clone(),
            id,
            link_tx,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    id: u64,
    link_tx: Arc<watch::Sender<LinkStatus>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link_tx.subscribe()
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn MessageSource>, TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        state.requests.push(request.clone());

        if !state.links.contains_key(&self.id) {
            return Err(TransportError::ConnectionLost("connection dropped".into()));
        }
        if state.reject_subscribes > 0 {
            state.reject_subscribes -= 1;
            state.events.push(BrokerEvent::SubscribeRejected);
            return Err(TransportError::Subscribe(format!(
                "no stream matches subject '{}'",
                request.subject
            )));
        }

        let cursor = match request.deliver_start {
            DeliverStart::ByStartTime(start) => Some(
                state
                    .messages
                    .iter()
                    .position(|message| message.published >= start)
                    .unwrap_or(state.messages.len()),
            ),
            DeliverStart::Resume => None,
        };

        match cursor {
            // A start time always recreates the durable.
            Some(cursor) => {
                state.consumers.insert(
                    request.durable.clone(),
                    DurableConsumer {
                        filter_subject: request.filter_subject.clone(),
                        cursor,
                        max_deliver: request.max_deliver,
                        ..Default::default()
                    },
                );
            }
            None => {
                state
                    .consumers
                    .entry(request.durable.clone())
                    .or_insert_with(|| DurableConsumer {
                        filter_subject: request.filter_subject.clone(),
                        max_deliver: request.max_deliver,
                        ..Default::default()
                    });
            }
        }

        state.events.push(BrokerEvent::Subscribed {
            durable: request.durable.clone(),
            deliver_start: request.deliver_start,
        });

        Ok(Box::new(MockSource {
            broker: self.broker.clone(),
            connection: self.id,
            durable: request.durable.clone(),
            idle_wait: request.idle_wait,
            active: true,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().unwrap();
        match state.links.remove(&self.id) {
            Some(link) => {
                link.send_replace(LinkStatus::Down);
                state.events.push(BrokerEvent::Closed(self.id));
                Ok(())
            }
            None => Err(TransportError::Close("connection already dropped".into())),
        }
    }
}

struct MockSource {
    broker: MockBroker,
    connection: u64,
    durable: String,
    idle_wait: std::time::Duration,
    active: bool,
}

impl MockSource {
    fn take_next(&self, state: &mut BrokerState) -> Option<Delivery> {
        let BrokerState {
            messages,
            consumers,
            events,
            ..
        } = state;
        let consumer = consumers.get_mut(&self.durable)?;

        let message = loop {
            if let Some(sequence) = consumer.redeliver.pop_front() {
                break messages.get(sequence as usize - 1)?;
            }
            let message = messages.get(consumer.cursor)?;
            consumer.cursor += 1;
            if subject_matches(&consumer.filter_subject, &message.subject) {
                break message;
            }
        };

        let count = consumer.deliveries.entry(message.sequence).or_insert(0);
        *count += 1;
        let count = *count;
        consumer.pending.insert(message.sequence, self.connection);
        events.push(BrokerEvent::Delivered {
            sequence: message.sequence,
            count,
        });

        Some(Delivery {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            stream_sequence: Some(message.sequence),
            published: Some(message.published),
            delivery_count: Some(count),
            token: ResolutionToken::new(Box::new(MockAck {
                broker: self.broker.clone(),
                connection: self.connection,
                durable: self.durable.clone(),
                sequence: message.sequence,
            })),
        })
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        if !self.active {
            return Err(TransportError::ConnectionLost("unsubscribed".into()));
        }

        loop {
            let notified = self.broker.notify.notified();
            {
                let mut state = self.broker.state.lock().unwrap();
                if !state.links.contains_key(&self.connection) {
                    return Err(TransportError::ConnectionLost("connection dropped".into()));
                }
                if let Some(delivery) = self.take_next(&mut state) {
                    return Ok(Some(delivery));
                }
            }
            if tokio::time::timeout(self.idle_wait, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        if self.active {
            self.active = false;
            self.broker
                .record(BrokerEvent::Unsubscribed(self.durable.clone()));
        }
        Ok(())
    }
}

struct MockAck {
    broker: MockBroker,
    connection: u64,
    durable: String,
    sequence: u64,
}

impl MockAck {
    fn resolve(&self, ack: bool) -> Result<(), TransportError> {
        let notify = {
            let mut state = self.broker.state.lock().unwrap();
            if !state.links.contains_key(&self.connection) {
                return Err(TransportError::Ack("connection dropped".into()));
            }

            let BrokerState {
                consumers, events, ..
            } = &mut *state;
            let consumer = consumers
                .get_mut(&self.durable)
                .ok_or_else(|| TransportError::Ack("unknown consumer".into()))?;
            consumer.pending.remove(&self.sequence);

            if ack {
                consumer.acked.insert(self.sequence);
                events.push(BrokerEvent::Acked(self.sequence));
                false
            } else {
                events.push(BrokerEvent::Nacked(self.sequence));
                let delivered = consumer.deliveries.get(&self.sequence).copied().unwrap_or(0);
                let capped = consumer
                    .max_deliver
                    .is_some_and(|max| delivered >= u64::from(max));
                if !capped {
                    consumer.redeliver.push_back(self.sequence);
                }
                !capped
            }
        };
        if notify {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MockAck {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.resolve(true)
    }

    async fn nak(self: Box<Self>) -> Result<(), TransportError> {
        self.resolve(false)
    }
}

/// NATS subject matching with `*` (one token) and `>` (one or more trailing tokens).
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
