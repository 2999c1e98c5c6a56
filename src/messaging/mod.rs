//! # Messaging Module
//!
//! RabbitMQ plumbing for the export pipeline.
//!
//! ## Features
//! - Transport-neutral broker traits with a `lapin` and an in-process backend
//! - Work queue topology with dead-lettering, asserted on every new channel
//! - Broker client supervising one connection with bounded-then-unbounded reconnects

pub mod amqp;
pub mod broker;
pub mod client;
pub mod error;
pub mod in_memory;
pub mod topology;

pub use amqp::AmqpConnector;
pub use broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, ExchangeType,
    LinkMonitor, PublishProperties, QueueSpec,
};
pub use client::{BrokerClient, ConnectionState};
pub use error::BrokerError;
pub use in_memory::{BrokerOperation, InMemoryBroker, StoredMessage};
pub use topology::{assert_topology, QueueTopology};
