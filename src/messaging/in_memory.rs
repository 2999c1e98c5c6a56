//! In-process broker.
//!
//! Implements the broker traits with the AMQP 0.9.1 behaviour the export
//! pipeline relies on: declaration equivalence checks, direct routing through
//! the default exchange, per-channel prefetch, manual acknowledgement,
//! dead-lettering on reject and requeue of unacknowledged messages when a
//! channel goes away. Faults can be injected to drive the reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, ExchangeType,
    LinkMonitor, PublishProperties, QueueSpec,
};
use super::error::BrokerError;

/// A message at rest in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub properties: PublishProperties,
    pub redelivered: bool,
}

/// Entry in the broker's operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOperation {
    Connect { connection: u64 },
    OpenChannel { connection: u64, channel: u64 },
    DeclareExchange { channel: u64, name: String },
    DeclareQueue { channel: u64, name: String },
    BindQueue { channel: u64, queue: String, exchange: String },
    Publish { channel: u64, queue: String },
    Prefetch { channel: u64, count: u16 },
    Consume { channel: u64, queue: String },
    Deliver { channel: u64, queue: String, delivery_tag: u64 },
    Ack { channel: u64, delivery_tag: u64 },
    Reject { channel: u64, delivery_tag: u64 },
    CloseChannel { channel: u64 },
    CloseConnection { connection: u64 },
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    connection: u64,
    monitor: LinkMonitor,
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
}

#[derive(Debug)]
struct ConnectionEntry {
    monitor: LinkMonitor,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, (ExchangeType, bool)>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    refuse_connections: u32,
    offline: bool,
    operations: Vec<BrokerOperation>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_channel(&mut self, channel: u64) -> Result<&mut ChannelState, BrokerError> {
        self.channels
            .get_mut(&channel)
            .ok_or_else(|| BrokerError::channel(format!("channel {channel} is closed")))
    }

    /// Route through `exchange`; the empty name is the default exchange.
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        let mut routed = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
                routed += 1;
            }
        }
        routed
    }

    /// Remove a channel, returning its unacked messages to the head of their
    /// queues marked as redelivered.
    fn close_channel(&mut self, channel: u64, reason: &str) -> bool {
        let Some(mut state) = self.channels.remove(&channel) else {
            return false;
        };

        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = state.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(StoredMessage {
                        redelivered: true,
                        ..unacked.message
                    });
                }
            }
        }

        state.monitor.trip(reason.to_string());
        self.operations.push(BrokerOperation::CloseChannel { channel });
        true
    }

    fn close_connection(&mut self, connection: u64, reason: &str) -> bool {
        let Some(entry) = self.connections.remove(&connection) else {
            return false;
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, reason);
        }

        entry.monitor.trip(reason.to_string());
        self.operations
            .push(BrokerOperation::CloseConnection { connection });
        true
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    version: watch::Sender<u64>,
}

impl Shared {
    /// Run `f` under the state lock and wake every consumer stream.
    fn mutate<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let result = f(&mut self.state.lock());
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        result
    }
}

/// In-process broker handle. Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (version, _rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                version,
            }),
        }
    }

    /// Connector opening connections to this broker.
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(InMemoryConnector {
            broker: self.clone(),
        })
    }

    /// Ready messages in `queue`, excluding unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Snapshot of the ready messages in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages delivered but not yet settled, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Declared parameters of `queue`.
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.spec.clone())
    }

    /// Declared type and durability of `exchange`.
    pub fn exchange(&self, exchange: &str) -> Option<(ExchangeType, bool)> {
        self.shared.state.lock().exchanges.get(exchange).copied()
    }

    /// Whether `queue` is bound to `exchange` with `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.shared.state.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Enqueue a raw body on `queue` through the default exchange, bypassing
    /// any channel. Used to plant malformed payloads.
    pub fn publish_raw(&self, queue: &str, body: impl Into<Vec<u8>>) -> bool {
        let message = StoredMessage {
            body: body.into(),
            properties: PublishProperties::persistent_json(),
            redelivered: false,
        };
        self.shared.mutate(|state| state.route("", queue, message)) > 0
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.shared.mutate(|state| state.refuse_connections = count);
    }

    /// While offline every connection attempt fails.
    pub fn set_offline(&self, offline: bool) {
        self.shared.mutate(|state| state.offline = offline);
    }

    /// Force-close every open connection, as a broker restart would.
    pub fn drop_connections(&self) -> usize {
        self.shared.mutate(|state| {
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .filter(|id| state.close_connection(*id, "CONNECTION_FORCED - broker shutdown"))
                .count()
        })
    }

    /// Force-close every channel that holds or consumes from `queue`.
    pub fn close_consumer_channels(&self, queue: &str) -> usize {
        let consumers = self.consumers(queue);
        self.shared.mutate(|state| {
            consumers
                .into_iter()
                .filter(|id| state.close_channel(*id, "CHANNEL_ERROR - forced close"))
                .count()
        })
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Open channels.
    pub fn channel_count(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    /// Everything the broker has been asked to do, in order.
    pub fn operations(&self) -> Vec<BrokerOperation> {
        self.shared.state.lock().operations.clone()
    }

    fn consumers(&self, queue: &str) -> Vec<u64> {
        let state = self.shared.state.lock();
        let mut ids: Vec<u64> = state
            .operations
            .iter()
            .filter_map(|op| match op {
                BrokerOperation::Consume { channel, queue: q } if q == queue => Some(*channel),
                _ => None,
            })
            .filter(|id| state.channels.contains_key(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Connector for an [`InMemoryBroker`].
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let shared = self.broker.shared.clone();
        let (id, monitor) = shared.mutate(|state| {
            if state.offline {
                return Err(BrokerError::connection("connection refused"));
            }
            if state.refuse_connections > 0 {
                state.refuse_connections -= 1;
                return Err(BrokerError::connection("connection refused"));
            }
            let id = state.next_id();
            let monitor = LinkMonitor::new();
            state.connections.insert(
                id,
                ConnectionEntry {
                    monitor: monitor.clone(),
                },
            );
            state.operations.push(BrokerOperation::Connect { connection: id });
            Ok((id, monitor))
        })?;

        debug!(connection = id, "In-memory connection opened");
        Ok(Arc::new(InMemoryConnection {
            shared,
            id,
            monitor,
        }))
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    monitor: LinkMonitor,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = self.id;
        let (id, monitor) = self.shared.mutate(|state| {
            if !state.connections.contains_key(&connection) {
                return Err(BrokerError::connection(format!(
                    "connection {connection} is closed"
                )));
            }
            let id = state.next_id();
            let monitor = LinkMonitor::new();
            state.channels.insert(
                id,
                ChannelState {
                    connection,
                    monitor: monitor.clone(),
                    prefetch: 0,
                    unacked: HashMap::new(),
                    next_delivery_tag: 0,
                },
            );
            state
                .operations
                .push(BrokerOperation::OpenChannel { connection, channel: id });
            Ok((id, monitor))
        })?;

        Ok(Arc::new(InMemoryChannel {
            shared: self.shared.clone(),
            id,
            monitor,
        }))
    }

    fn is_open(&self) -> bool {
        !self.monitor.is_tripped() && self.shared.state.lock().connections.contains_key(&self.id)
    }

    fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let id = self.id;
        self.shared
            .mutate(|state| state.close_connection(id, "closed by application"));
        Ok(())
    }
}

/// Channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    monitor: LinkMonitor,
}

enum Next {
    Ready(InMemoryDelivery),
    Wait,
    Closed,
}

impl InMemoryChannel {
    /// Close the channel with a broker-side error, as AMQP does on a failed
    /// declaration.
    fn fail(state: &mut BrokerState, channel: u64, error: BrokerError) -> BrokerError {
        state.close_channel(channel, &error.to_string());
        error
    }

    fn next_delivery(shared: &Arc<Shared>, channel: u64, queue: &str) -> Next {
        let mut state = shared.state.lock();
        let state = &mut *state;

        let Some(chan) = state.channels.get(&channel) else {
            return Next::Closed;
        };
        if chan.prefetch > 0 && chan.unacked.len() >= chan.prefetch as usize {
            return Next::Wait;
        }
        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
        else {
            return Next::Wait;
        };

        let Some(chan) = state.channels.get_mut(&channel) else {
            return Next::Closed;
        };
        chan.next_delivery_tag += 1;
        let delivery_tag = chan.next_delivery_tag;
        chan.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        state.operations.push(BrokerOperation::Deliver {
            channel,
            queue: queue.to_string(),
            delivery_tag,
        });

        Next::Ready(InMemoryDelivery {
            shared: shared.clone(),
            channel,
            delivery_tag,
            body: message.body,
            redelivered: message.redelivered,
        })
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state.live_channel(channel)?;
            state.operations.push(BrokerOperation::DeclareExchange {
                channel,
                name: name.to_string(),
            });
            match state.exchanges.get(name) {
                Some(existing) if *existing != (kind, durable) => {
                    let error = BrokerError::topology_mismatch(
                        name,
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg 'type' or 'durable' for exchange '{name}'"
                        ),
                    );
                    Err(Self::fail(state, channel, error))
                }
                Some(_) => Ok(()),
                None => {
                    state.exchanges.insert(name.to_string(), (kind, durable));
                    Ok(())
                }
            }
        })
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state.live_channel(channel)?;
            state.operations.push(BrokerOperation::DeclareQueue {
                channel,
                name: name.to_string(),
            });
            match state.queues.get(name) {
                Some(existing) if existing.spec != *spec => {
                    let error = BrokerError::topology_mismatch(
                        name,
                        format!("PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"),
                    );
                    Err(Self::fail(state, channel, error))
                }
                Some(_) => Ok(()),
                None => {
                    state.queues.insert(
                        name.to_string(),
                        QueueState {
                            spec: spec.clone(),
                            messages: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state.live_channel(channel)?;
            state.operations.push(BrokerOperation::BindQueue {
                channel,
                queue: queue.to_string(),
                exchange: exchange.to_string(),
            });
            if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
                let error = BrokerError::channel(format!(
                    "NOT_FOUND - no queue '{queue}' or exchange '{exchange}'"
                ));
                return Err(Self::fail(state, channel, error));
            }
            let exists = state.bindings.iter().any(|b| {
                b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
            });
            if !exists {
                state.bindings.push(Binding {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    queue: queue.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state
                .live_channel(channel)
                .map_err(|e| BrokerError::publish(queue, e.to_string()))?;
            state.operations.push(BrokerOperation::Publish {
                channel,
                queue: queue.to_string(),
            });
            let message = StoredMessage {
                body: body.to_vec(),
                properties: properties.clone(),
                redelivered: false,
            };
            if state.route("", queue, message) == 0 {
                debug!(queue = %queue, "Unroutable message dropped");
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state.live_channel(channel)?.prefetch = count;
            state.operations.push(BrokerOperation::Prefetch { channel, count });
            Ok(())
        })
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let channel = self.id;
        self.shared.mutate(|state| {
            state.live_channel(channel)?;
            if !state.queues.contains_key(queue) {
                let error = BrokerError::channel(format!("NOT_FOUND - no queue '{queue}'"));
                return Err(Self::fail(state, channel, error));
            }
            state.operations.push(BrokerOperation::Consume {
                channel,
                queue: queue.to_string(),
            });
            Ok(())
        })?;

        let shared = self.shared.clone();
        let wakeups = shared.version.subscribe();
        let queue = queue.to_string();

        let stream = stream::unfold(
            (shared, wakeups, queue),
            move |(shared, mut wakeups, queue)| async move {
                loop {
                    wakeups.borrow_and_update();
                    match Self::next_delivery(&shared, channel, &queue) {
                        Next::Ready(delivery) => {
                            let item: Box<dyn Delivery> = Box::new(delivery);
                            return Some((Ok(item), (shared, wakeups, queue)));
                        }
                        Next::Closed => return None,
                        Next::Wait => {
                            if wakeups.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        !self.monitor.is_tripped() && self.shared.state.lock().channels.contains_key(&self.id)
    }

    fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let id = self.id;
        self.shared
            .mutate(|state| state.close_channel(id, "closed by application"));
        Ok(())
    }
}

/// Delivery from an [`InMemoryBroker`] queue.
pub struct InMemoryDelivery {
    shared: Arc<Shared>,
    channel: u64,
    delivery_tag: u64,
    body: Vec<u8>,
    redelivered: bool,
}

impl InMemoryDelivery {
    fn settle(&self) -> Result<Unacked, BrokerError> {
        let mut state = self.shared.state.lock();
        let chan = state.channels.get_mut(&self.channel).ok_or_else(|| {
            BrokerError::Acknowledge(format!("channel {} is closed", self.channel))
        })?;
        chan.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            BrokerError::Acknowledge(format!("unknown delivery tag {}", self.delivery_tag))
        })
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        let (channel, delivery_tag) = (self.channel, self.delivery_tag);
        self.shared.mutate(|state| {
            state.operations.push(BrokerOperation::Ack {
                channel,
                delivery_tag,
            })
        });
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let unacked = self.settle()?;
        let (channel, delivery_tag) = (self.channel, self.delivery_tag);
        self.shared.mutate(|state| {
            state.operations.push(BrokerOperation::Reject {
                channel,
                delivery_tag,
            });
            let spec = state.queues.get(&unacked.queue).map(|q| q.spec.clone());
            let Some(exchange) = spec.as_ref().and_then(|s| s.dead_letter_exchange.clone())
            else {
                debug!(queue = %unacked.queue, "Rejected message discarded");
                return;
            };
            let routing_key = spec
                .and_then(|s| s.dead_letter_routing_key)
                .unwrap_or_else(|| unacked.queue.clone());
            let message = StoredMessage {
                redelivered: false,
                ..unacked.message
            };
            if state.route(&exchange, &routing_key, message) == 0 {
                debug!(exchange = %exchange, "Dead-lettered message was unroutable");
            }
        });
        Ok(())
    }
}
