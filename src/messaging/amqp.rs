//! RabbitMQ transport for the export service.
//!
//! Implements the broker traits over `lapin` (AMQP 0.9.1). Error callbacks
//! registered on the connection and on every channel trip the matching
//! [`LinkMonitor`], which is what the broker client supervises.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, instrument, warn};

use super::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, ExchangeType,
    LinkMonitor, PublishProperties, QueueSpec, ARG_DEAD_LETTER_EXCHANGE,
    ARG_DEAD_LETTER_ROUTING_KEY, DELIVERY_MODE_PERSISTENT,
};
use super::error::BrokerError;
use crate::types::BrokerConfig;

/// Opens AMQP connections from a [`BrokerConfig`].
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    #[instrument(skip(self), fields(url = %self.config.redacted_url()))]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());

        let connection = Connection::connect(&self.config.url, properties)
            .await
            .map_err(|e| BrokerError::connection(e.to_string()))?;

        let monitor = LinkMonitor::new();
        {
            let monitor = monitor.clone();
            connection.on_error(move |err| {
                error!(error = %err, "RabbitMQ connection error");
                monitor.trip(format!("connection error: {err}"));
            });
        }

        info!("RabbitMQ connection established");

        Ok(Arc::new(AmqpConnection {
            connection,
            monitor,
        }))
    }
}

/// A `lapin` connection with its failure monitor.
pub struct AmqpConnection {
    connection: Connection,
    monitor: LinkMonitor,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::channel(format!("confirm.select failed: {e}")))?;

        let monitor = LinkMonitor::new();
        {
            let monitor = monitor.clone();
            let id = channel.id();
            channel.on_error(move |err| {
                warn!(channel = id, error = %err, "RabbitMQ channel error");
                monitor.trip(format!("channel {id} error: {err}"));
            });
        }

        debug!(channel = channel.id(), "RabbitMQ channel opened");

        Ok(Arc::new(AmqpChannel { channel, monitor }))
    }

    fn is_open(&self) -> bool {
        !self.monitor.is_tripped() && self.connection.status().connected()
    }

    fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::connection(e.to_string()))
    }
}

/// A `lapin` channel with its failure monitor.
pub struct AmqpChannel {
    channel: Channel,
    monitor: LinkMonitor,
}

impl AmqpChannel {
    /// Map a `lapin` error for an operation on `name`, tripping the monitor
    /// when the channel did not survive it.
    fn fail(&self, name: &str, err: lapin::Error) -> BrokerError {
        let text = err.to_string();
        let mapped = if text.contains("PRECONDITION_FAILED") || text.contains("PRECONDITIONFAILED")
        {
            BrokerError::topology_mismatch(name, text)
        } else {
            BrokerError::channel(text)
        };
        if !self.channel.status().connected() {
            self.monitor.trip(mapped.to_string());
        }
        mapped
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        args.insert(
            ARG_DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(routing_key) = &spec.dead_letter_routing_key {
        args.insert(
            ARG_DEAD_LETTER_ROUTING_KEY.into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    args
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(name, e))
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.fail(name, e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(queue, e))
    }

    #[instrument(skip(self, body, properties), fields(bytes = body.len()))]
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let mut amqp_properties =
            BasicProperties::default().with_content_type(properties.content_type.clone().into());
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                amqp_properties,
            )
            .await
            .map_err(|e| match self.fail(queue, e) {
                BrokerError::Channel(message) => BrokerError::publish(queue, message),
                other => other,
            })?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::publish(queue, format!("confirmation failed: {e}")))?;
        check_confirmation(queue, &confirmation)?;

        debug!(queue = %queue, "Message published");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.fail("basic.qos", e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(queue, e))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Box::new(AmqpDelivery { inner: d }) as Box<dyn Delivery>)
                .map_err(|e| BrokerError::channel(e.to_string()))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        !self.monitor.is_tripped() && self.channel.status().connected()
    }

    fn monitor(&self) -> &LinkMonitor {
        &self.monitor
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::channel(e.to_string()))
    }
}

/// A `lapin` delivery.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

/// Publisher confirms are enabled on every channel, so anything but an ack
/// means the broker did not take responsibility for the message.
fn check_confirmation(queue: &str, confirmation: &Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(BrokerError::publish(queue, "broker nacked the message")),
        Confirmation::NotRequested => Err(BrokerError::publish(
            queue,
            "publisher confirms not enabled on channel",
        )),
    }
}
