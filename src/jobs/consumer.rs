//! Work queue consumer and its supervisor.
//!
//! The consumer owns a dedicated channel with prefetch 1 and handles one
//! delivery at a time: decode, run the handler, then ack or dead-letter.
//! When the channel is lost the supervisor waits `resubscribe_delay`,
//! re-asserts topology on a fresh channel and consumes again, forever.
//! Only the initial start is bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::ExportError;
use crate::clock::Clock;
use crate::messaging::{
    assert_topology, BrokerChannel, BrokerClient, BrokerError, Delivery, DeliveryStream,
    QueueTopology,
};
use crate::types::{ConsumerConfig, JobMessage, JobPayloadError};

/// Deliveries in flight per subscription.
pub const CONSUMER_PREFETCH: u16 = 1;

/// Upper bound on the delay between initial start attempts.
pub const MAX_STARTUP_BACKOFF: Duration = Duration::from_secs(10);

/// Why a job did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobFailure {
    /// Body could not be decoded into a job. Poison message.
    #[error(transparent)]
    Payload(#[from] JobPayloadError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove from the work queue.
    Ack,
    /// Reject without requeue, routing to the dead-letter queue.
    DeadLetter,
}

/// Settlement for a job outcome. Failures are never requeued onto the work
/// queue.
pub fn disposition(outcome: &Result<(), JobFailure>) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(JobFailure::Payload(_)) | Err(JobFailure::Export(_)) => Disposition::DeadLetter,
    }
}

/// Processes one decoded job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobMessage) -> Result<(), JobFailure>;
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer failed to start after {attempts} attempts: {reason}")]
    StartupFailed { attempts: u32, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A live subscription on the work queue. Lives no longer than its channel.
pub struct ConsumerSubscription {
    pub consumer_tag: String,
    pub channel: Arc<dyn BrokerChannel>,
    pub topology: QueueTopology,
}

enum SubscriptionEnd {
    Stopped,
    Lost(String),
}

/// Delay before the `restart`-th initial start retry (1-based).
pub fn startup_backoff(restart: u32) -> Duration {
    let factor = 2u64.saturating_pow(restart.min(16));
    Duration::from_secs(factor).min(MAX_STARTUP_BACKOFF)
}

/// Work queue consumer with subscription supervision.
pub struct ExportConsumer {
    client: BrokerClient,
    topology: QueueTopology,
    handler: Arc<dyn JobHandler>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    stop: watch::Sender<bool>,
    subscriptions: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
}

impl ExportConsumer {
    pub fn new(
        client: BrokerClient,
        topology: QueueTopology,
        handler: Arc<dyn JobHandler>,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> Self {
        let (stop, _rx) = watch::channel(false);
        Self {
            client,
            topology,
            handler,
            clock,
            config,
            stop,
            subscriptions: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Subscriptions opened so far, including re-subscriptions.
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::SeqCst)
    }

    /// Ask the supervisor to stop. An in-flight job finishes first.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the broker, subscribe, and hand the subscription to a
    /// background supervisor.
    ///
    /// Each start attempt polls readiness `startup_poll_attempts` times.
    /// Failed attempts are retried with capped exponential backoff up to
    /// `startup_max_restarts` times.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ConsumerError> {
        let max_restarts = self.config.startup_max_restarts;
        let mut restart = 0;

        loop {
            let reason = if self
                .client
                .wait_until_ready(self.config.startup_poll_attempts, self.config.startup_poll_delay)
                .await
            {
                match self.subscribe().await {
                    Ok((subscription, deliveries)) => {
                        info!(
                            queue = %self.topology.work_queue,
                            consumer_tag = %subscription.consumer_tag,
                            "Export consumer started"
                        );
                        let consumer = self.clone();
                        return Ok(tokio::spawn(async move {
                            consumer.supervise(subscription, deliveries).await
                        }));
                    }
                    Err(e) => e.to_string(),
                }
            } else {
                "RabbitMQ connection not available".to_string()
            };

            if restart >= max_restarts || self.is_stopped() {
                error!(attempts = restart + 1, reason = %reason, "Export consumer failed to start");
                return Err(ConsumerError::StartupFailed {
                    attempts: restart + 1,
                    reason,
                });
            }

            restart += 1;
            let delay = startup_backoff(restart);
            warn!(
                restart,
                max_restarts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Export consumer start failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    /// Open a dedicated channel, assert topology and start consuming.
    pub async fn subscribe(&self) -> Result<(ConsumerSubscription, DeliveryStream), BrokerError> {
        let channel = self.client.open_dedicated_channel().await?;

        match self.consume_on(&channel).await {
            Ok((consumer_tag, deliveries)) => {
                self.subscriptions.fetch_add(1, Ordering::SeqCst);
                Ok((
                    ConsumerSubscription {
                        consumer_tag,
                        channel,
                        topology: self.topology.clone(),
                    },
                    deliveries,
                ))
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Error closing failed consumer channel");
                }
                Err(e)
            }
        }
    }

    async fn consume_on(
        &self,
        channel: &Arc<dyn BrokerChannel>,
    ) -> Result<(String, DeliveryStream), BrokerError> {
        assert_topology(channel.as_ref(), &self.topology).await?;
        channel.set_prefetch(CONSUMER_PREFETCH).await?;

        let consumer_tag = format!("csv_export_consumer_{}", Uuid::new_v4().simple());
        let deliveries = channel
            .consume(&self.topology.work_queue, &consumer_tag)
            .await?;
        Ok((consumer_tag, deliveries))
    }

    async fn supervise(
        self: Arc<Self>,
        mut subscription: ConsumerSubscription,
        mut deliveries: DeliveryStream,
    ) {
        loop {
            match self.run_subscription(&subscription, &mut deliveries).await {
                SubscriptionEnd::Stopped => break,
                SubscriptionEnd::Lost(reason) => {
                    warn!(
                        consumer_tag = %subscription.consumer_tag,
                        reason = %reason,
                        "Consumer channel lost, scheduling re-subscription"
                    );
                }
            }

            match self.resubscribe().await {
                Some((next, stream)) => {
                    subscription = next;
                    deliveries = stream;
                }
                None => break,
            }
        }

        if let Err(e) = subscription.channel.close().await {
            debug!(error = %e, "Error closing consumer channel");
        }
        info!("Export consumer stopped");
    }

    /// Retry subscribing every `resubscribe_delay` until it works or the
    /// consumer is stopped.
    async fn resubscribe(&self) -> Option<(ConsumerSubscription, DeliveryStream)> {
        loop {
            self.clock.sleep(self.config.resubscribe_delay).await;
            if self.is_stopped() {
                return None;
            }
            match self.subscribe().await {
                Ok((subscription, deliveries)) => {
                    info!(
                        consumer_tag = %subscription.consumer_tag,
                        "Export consumer re-subscribed"
                    );
                    return Some((subscription, deliveries));
                }
                Err(e) => warn!(error = %e, "Re-subscription failed"),
            }
        }
    }

    async fn run_subscription(
        &self,
        subscription: &ConsumerSubscription,
        deliveries: &mut DeliveryStream,
    ) -> SubscriptionEnd {
        loop {
            tokio::select! {
                _ = self.stopped() => return SubscriptionEnd::Stopped,
                reason = subscription.channel.monitor().tripped() => {
                    return SubscriptionEnd::Lost(reason);
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery.as_ref()).await,
                    Some(Err(e)) => return SubscriptionEnd::Lost(e.to_string()),
                    None => return SubscriptionEnd::Lost("delivery stream ended".to_string()),
                },
            }
        }
    }

    /// Handle one delivery and settle it.
    pub async fn process(&self, delivery: &dyn Delivery) {
        let outcome = match JobMessage::from_bytes(delivery.body()) {
            Ok(job) => self.handler.handle(&job).await,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag(),
                    error = %e,
                    "Malformed export job"
                );
                Err(JobFailure::Payload(e))
            }
        };

        match disposition(&outcome) {
            Disposition::Ack => match delivery.ack().await {
                Ok(()) => {
                    self.acked.fetch_add(1, Ordering::SeqCst);
                    debug!(delivery_tag = delivery.delivery_tag(), "Export job acknowledged");
                }
                Err(e) => error!(error = %e, "Failed to acknowledge export job"),
            },
            Disposition::DeadLetter => match delivery.reject().await {
                Ok(()) => {
                    self.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        delivery_tag = delivery.delivery_tag(),
                        redelivered = delivery.redelivered(),
                        "Export job dead-lettered"
                    );
                }
                Err(e) => error!(error = %e, "Failed to dead-letter export job"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingClock;
    use crate::jobs::executor::ExportStage;
    use crate::messaging::InMemoryBroker;
    use crate::types::ReconnectPolicy;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &JobMessage) -> Result<(), JobFailure> {
            self.seen.lock().push(job.admin_email().to_string());
            if self.fail {
                Err(ExportError::new(ExportStage::Delivery, "smtp down").into())
            } else {
                Ok(())
            }
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            resubscribe_delay: Duration::from_secs(5),
            startup_poll_attempts: 3,
            startup_poll_delay: Duration::from_secs(2),
            startup_max_restarts: 2,
            ..Default::default()
        }
    }

    fn consumer(
        broker: &InMemoryBroker,
        clock: Arc<RecordingClock>,
        handler: Arc<ScriptedHandler>,
    ) -> (BrokerClient, Arc<ExportConsumer>) {
        let client = BrokerClient::new(broker.connector(), clock.clone(), ReconnectPolicy::default());
        let consumer = Arc::new(ExportConsumer::new(
            client.clone(),
            QueueTopology::default(),
            handler,
            clock,
            config(),
        ));
        (client, consumer)
    }

    async fn settle<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..1000 {
            if condition() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        condition()
    }

    #[test]
    fn test_disposition_is_a_function_of_the_outcome() {
        assert_eq!(disposition(&Ok(())), Disposition::Ack);
        assert_eq!(
            disposition(&Err(JobPayloadError::Malformed("eof".into()).into())),
            Disposition::DeadLetter
        );
        assert_eq!(
            disposition(&Err(ExportError::new(ExportStage::Load, "db").into())),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn test_startup_backoff_is_capped() {
        assert_eq!(startup_backoff(1), Duration::from_secs(2));
        assert_eq!(startup_backoff(2), Duration::from_secs(4));
        assert_eq!(startup_backoff(3), Duration::from_secs(8));
        assert_eq!(startup_backoff(4), Duration::from_secs(10));
        assert_eq!(startup_backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_start_fails_after_bounded_restarts() {
        let broker = InMemoryBroker::new();
        let clock = Arc::new(RecordingClock::new());
        let (_client, consumer) = consumer(&broker, clock.clone(), Arc::default());

        let result = consumer.start().await;

        assert!(matches!(
            result,
            Err(ConsumerError::StartupFailed { attempts: 3, .. })
        ));
        let two = Duration::from_secs(2);
        assert_eq!(
            clock.sleeps(),
            vec![
                two,
                two,
                Duration::from_secs(2),
                two,
                two,
                Duration::from_secs(4),
                two,
                two
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_without_handler() {
        let broker = InMemoryBroker::new();
        let clock = Arc::new(RecordingClock::new());
        let handler = Arc::new(ScriptedHandler::default());
        let (client, consumer) = consumer(&broker, clock, handler.clone());
        client.start().await.unwrap();
        let supervisor = consumer.start().await.unwrap();

        broker.publish_raw("movie_exports", "not json");

        assert!(settle(|| consumer.dead_lettered() == 1).await);
        assert!(handler.seen.lock().is_empty());
        assert_eq!(broker.queue_depth("movie_exports_failed"), 1);

        consumer.shutdown();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_channel_loss() {
        let broker = InMemoryBroker::new();
        let clock = Arc::new(RecordingClock::new());
        let handler = Arc::new(ScriptedHandler::default());
        let (client, consumer) = consumer(&broker, clock.clone(), handler.clone());
        client.start().await.unwrap();
        let supervisor = consumer.start().await.unwrap();
        assert_eq!(consumer.subscriptions(), 1);

        clock.reset();
        assert_eq!(broker.close_consumer_channels("movie_exports"), 1);
        assert!(settle(|| consumer.subscriptions() == 2).await);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);

        broker.publish_raw("movie_exports", r#"{"adminEmail":"a@x.com"}"#);
        assert!(settle(|| consumer.acked() == 1).await);
        assert_eq!(*handler.seen.lock(), vec!["a@x.com".to_string()]);

        consumer.shutdown();
        supervisor.await.unwrap();
    }
}
