//! Transport-neutral broker surface.
//!
//! The broker client, topology policy, producer and consumer only talk to
//! these traits. [`crate::messaging::amqp`] implements them over `lapin`,
//! [`crate::messaging::in_memory`] implements them in process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use super::error::BrokerError;

/// AMQP `x-dead-letter-exchange` queue argument.
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// AMQP `x-dead-letter-routing-key` queue argument.
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// AMQP delivery mode for messages that survive a broker restart.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Exchange types used by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeType::Direct => write!(f, "direct"),
        }
    }
}

/// Parameters of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub persistent: bool,
    pub content_type: String,
}

impl PublishProperties {
    /// Persistent JSON message.
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: "application/json".to_string(),
        }
    }
}

/// Observer for the health of a connection or channel.
///
/// Transport error/close callbacks call [`LinkMonitor::trip`]; supervisors
/// await [`LinkMonitor::tripped`]. A monitor trips at most once, so a burst
/// of error and close events for one link yields a single failure.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record a failure. Returns `false` if the monitor had already tripped.
    pub fn trip(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_tripped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Reason of the first failure, if any.
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolve once the link has failed, yielding the first reason.
    pub async fn tripped(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "link monitor dropped".to_string();
            }
        }
    }
}

/// Opens transport connections to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// One connection attempt. No retries.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live transport connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    fn monitor(&self) -> &LinkMonitor;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Stream of deliveries for one consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, BrokerError>>;

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish through the default exchange, routed by queue name.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Subscribe with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    fn is_open(&self) -> bool;

    fn monitor(&self) -> &LinkMonitor;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A message delivered to a consumer, pending acknowledgement.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    fn redelivered(&self) -> bool;

    /// Remove the message from its queue.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement without requeue; the queue's dead-letter
    /// arguments decide where the message goes.
    async fn reject(&self) -> Result<(), BrokerError>;
}
