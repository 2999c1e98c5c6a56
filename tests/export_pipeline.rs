//! End-to-end behaviour of the export pipeline over the in-process broker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use movie_export::clock::{Clock, RecordingClock, TokioClock};
use movie_export::jobs::{
    ExportConsumer, ExportExecutor, ExportJobProducer, JobFailure, JobHandler, ProducerError,
    CSV_HEADERS,
};
use movie_export::messaging::{
    assert_topology, BrokerClient, BrokerError, BrokerOperation, ExchangeType, InMemoryBroker,
    QueueSpec, QueueTopology,
};
use movie_export::output::RecordingMailer;
use movie_export::repository::InMemoryMovieSource;
use movie_export::types::{ConsumerConfig, JobMessage, MovieRecord, ReconnectPolicy};

fn movies(n: i64) -> Vec<MovieRecord> {
    (1..=n)
        .map(|id| MovieRecord {
            id,
            title: format!("Movie {id}"),
            description: format!("Description {id}"),
            director: format!("Director {id}"),
            release_date: NaiveDate::from_ymd_opt(2000, 1, id as u32).unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap(),
        })
        .collect()
}

fn consumer_config(temp_dir: &Path) -> ConsumerConfig {
    ConsumerConfig {
        resubscribe_delay: Duration::from_secs(5),
        startup_poll_attempts: 3,
        startup_poll_delay: Duration::from_secs(2),
        startup_max_restarts: 1,
        job_timeout: Duration::from_secs(30),
        temp_dir: temp_dir.to_path_buf(),
    }
}

/// Poll `condition` on the tokio clock for up to ~5s.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

struct Pipeline {
    broker: InMemoryBroker,
    client: BrokerClient,
    producer: ExportJobProducer,
    consumer: Arc<ExportConsumer>,
    mailer: Arc<RecordingMailer>,
    temp_dir: tempfile::TempDir,
}

impl Pipeline {
    async fn start(mailer: RecordingMailer, records: Vec<MovieRecord>) -> Self {
        let broker = InMemoryBroker::new();
        let clock: Arc<dyn Clock> = Arc::new(RecordingClock::new());
        let topology = QueueTopology::default();
        let temp_dir = tempfile::tempdir().unwrap();
        let mailer = Arc::new(mailer);

        let client = BrokerClient::with_topology(
            broker.connector(),
            clock.clone(),
            ReconnectPolicy::default(),
            topology.clone(),
        );
        client.start().await.unwrap();

        let executor = Arc::new(ExportExecutor::new(
            Arc::new(InMemoryMovieSource::new(records)),
            mailer.clone(),
            temp_dir.path(),
            Duration::from_secs(30),
        ));
        let consumer = Arc::new(ExportConsumer::new(
            client.clone(),
            topology.clone(),
            executor,
            clock,
            consumer_config(temp_dir.path()),
        ));
        consumer.start().await.unwrap();

        Self {
            producer: ExportJobProducer::new(client.clone(), topology),
            broker,
            client,
            consumer,
            mailer,
            temp_dir,
        }
    }
}

#[tokio::test]
async fn test_topology_assertion_is_idempotent_across_channels() {
    let broker = InMemoryBroker::new();
    let topology = QueueTopology::default();
    let connection = broker.connector().connect().await.unwrap();

    let first = connection.open_channel().await.unwrap();
    assert_topology(first.as_ref(), &topology).await.unwrap();
    let spec_after_first = broker.queue_spec(&topology.work_queue);

    let second = connection.open_channel().await.unwrap();
    assert_topology(second.as_ref(), &topology).await.unwrap();

    assert!(first.is_open());
    assert!(second.is_open());
    assert_eq!(broker.queue_spec(&topology.work_queue), spec_after_first);
    assert_eq!(
        broker.exchange(&topology.dead_letter_exchange),
        Some((ExchangeType::Direct, true))
    );
    assert!(broker.is_bound(
        &topology.dead_letter_queue,
        &topology.dead_letter_exchange,
        &topology.dead_letter_routing_key
    ));
}

#[tokio::test]
async fn test_conflicting_declaration_is_a_topology_mismatch() {
    let broker = InMemoryBroker::new();
    let connection = broker.connector().connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .declare_queue("movie_exports", &QueueSpec::durable())
        .await
        .unwrap();

    let fresh = connection.open_channel().await.unwrap();
    let result = assert_topology(fresh.as_ref(), &QueueTopology::default()).await;

    assert!(matches!(
        result,
        Err(BrokerError::TopologyMismatch { .. })
    ));
    assert!(!fresh.is_open());
    assert!(connection.is_open());
}

#[tokio::test]
async fn test_failed_job_is_dead_lettered_exactly_once() {
    let pipeline = Pipeline::start(RecordingMailer::failing("smtp down"), movies(2)).await;

    pipeline.producer.enqueue_export("a@x.com").await.unwrap();

    assert!(eventually(|| pipeline.broker.queue_depth("movie_exports_failed") == 1).await);
    // Give a requeue, if any, a chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pipeline.broker.queue_depth("movie_exports_failed"), 1);
    assert_eq!(pipeline.broker.queue_depth("movie_exports"), 0);
    assert_eq!(pipeline.broker.unacked_count(), 0);
    assert_eq!(pipeline.mailer.attempts(), 1);
    assert_eq!(pipeline.consumer.acked(), 0);

    let parked = pipeline.broker.messages("movie_exports_failed");
    assert_eq!(
        JobMessage::from_bytes(&parked[0].body).unwrap().admin_email(),
        "a@x.com"
    );
}

struct GatedHandler {
    events: Mutex<Vec<String>>,
    gate: Notify,
}

#[async_trait]
impl JobHandler for GatedHandler {
    async fn handle(&self, job: &JobMessage) -> Result<(), JobFailure> {
        self.events.lock().push(format!("start {}", job.admin_email()));
        if job.admin_email() == "first@x.com" {
            self.gate.notified().await;
        }
        self.events.lock().push(format!("end {}", job.admin_email()));
        Ok(())
    }
}

#[tokio::test]
async fn test_jobs_are_processed_one_at_a_time() {
    let broker = InMemoryBroker::new();
    let clock: Arc<dyn Clock> = Arc::new(RecordingClock::new());
    let topology = QueueTopology::default();
    let client = BrokerClient::new(broker.connector(), clock.clone(), ReconnectPolicy::default());
    client.start().await.unwrap();

    let handler = Arc::new(GatedHandler {
        events: Mutex::new(Vec::new()),
        gate: Notify::new(),
    });
    let consumer = Arc::new(ExportConsumer::new(
        client.clone(),
        topology.clone(),
        handler.clone(),
        clock,
        ConsumerConfig::default(),
    ));
    consumer.start().await.unwrap();

    let producer = ExportJobProducer::new(client, topology);
    producer.enqueue_export("first@x.com").await.unwrap();
    producer.enqueue_export("second@x.com").await.unwrap();

    assert!(eventually(|| handler.events.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*handler.events.lock(), vec!["start first@x.com".to_string()]);
    assert_eq!(broker.queue_depth("movie_exports"), 1);

    handler.gate.notify_one();
    assert!(eventually(|| consumer.acked() == 2).await);

    assert_eq!(
        *handler.events.lock(),
        vec![
            "start first@x.com".to_string(),
            "end first@x.com".to_string(),
            "start second@x.com".to_string(),
            "end second@x.com".to_string(),
        ]
    );

    // The second delivery only happened after the first was settled.
    let ops = broker.operations();
    let first_ack = ops
        .iter()
        .position(|op| matches!(op, BrokerOperation::Ack { delivery_tag: 1, .. }))
        .unwrap();
    let second_delivery = ops
        .iter()
        .position(|op| matches!(op, BrokerOperation::Deliver { delivery_tag: 2, .. }))
        .unwrap();
    assert!(first_ack < second_delivery);
}

#[tokio::test]
async fn test_delivery_failure_leaves_no_artifact() {
    let pipeline = Pipeline::start(RecordingMailer::failing("connection reset"), movies(5)).await;

    pipeline.producer.enqueue_export("a@x.com").await.unwrap();

    assert!(eventually(|| pipeline.consumer.dead_lettered() == 1).await);
    assert_eq!(pipeline.mailer.attempts(), 1);
    assert_eq!(files_in(pipeline.temp_dir.path()), 0);
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &JobMessage) -> Result<(), JobFailure> {
        self.seen.lock().push(job.admin_email().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_consumer_resumes_after_forced_channel_close() {
    let broker = InMemoryBroker::new();
    let clock = Arc::new(RecordingClock::new());
    let policy = ReconnectPolicy::default();
    let topology = QueueTopology::default();
    let client = BrokerClient::new(broker.connector(), clock.clone(), policy);
    client.start().await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let consumer = Arc::new(ExportConsumer::new(
        client.clone(),
        topology.clone(),
        handler.clone(),
        clock.clone(),
        ConsumerConfig::default(),
    ));
    consumer.start().await.unwrap();
    clock.reset();

    assert_eq!(broker.close_consumer_channels(&topology.work_queue), 1);
    assert!(eventually(|| consumer.subscriptions() == 2).await);
    assert!(clock.total_slept() <= policy.cycle_budget());

    ExportJobProducer::new(client, topology.clone())
        .enqueue_export("after@x.com")
        .await
        .unwrap();
    assert!(eventually(|| consumer.acked() == 1).await);
    assert_eq!(*handler.seen.lock(), vec!["after@x.com".to_string()]);

    // On the new channel, topology was declared before consuming.
    let ops = broker.operations();
    let (consume_at, channel) = ops
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, op)| match op {
            BrokerOperation::Consume { channel, .. } => Some((i, *channel)),
            _ => None,
        })
        .unwrap();
    let declared_at = ops
        .iter()
        .position(|op| {
            matches!(op, BrokerOperation::DeclareQueue { channel: c, name }
                if *c == channel && *name == topology.work_queue)
        })
        .unwrap();
    assert!(declared_at < consume_at);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_resumes_after_connection_loss_within_cycle_budget() {
    let broker = InMemoryBroker::new();
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let policy = ReconnectPolicy::default();
    let topology = QueueTopology::default();
    let client =
        BrokerClient::with_topology(broker.connector(), clock.clone(), policy, topology.clone());
    client.start().await.unwrap();

    let handler = Arc::new(RecordingHandler::default());
    let consumer = Arc::new(ExportConsumer::new(
        client.clone(),
        topology.clone(),
        handler.clone(),
        clock,
        ConsumerConfig::default(),
    ));
    consumer.start().await.unwrap();

    broker.refuse_connections(1);
    let lost_at = tokio::time::Instant::now();
    broker.drop_connections();

    let mut resumed = false;
    for _ in 0..600 {
        if consumer.subscriptions() == 2 {
            resumed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(resumed);
    assert!(lost_at.elapsed() <= policy.cycle_budget());
    assert!(client.is_ready());

    ExportJobProducer::new(client, topology)
        .enqueue_export("back@x.com")
        .await
        .unwrap();
    for _ in 0..50 {
        if consumer.acked() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(*handler.seen.lock(), vec!["back@x.com".to_string()]);
}

#[tokio::test]
async fn test_topology_mismatch_on_shared_channel_recovers_link() {
    let pipeline = Pipeline::start(RecordingMailer::new(), movies(2)).await;
    let misconfigured = ExportJobProducer::new(
        pipeline.client.clone(),
        QueueTopology {
            dead_letter_exchange: "other_dlx".to_string(),
            ..QueueTopology::default()
        },
    );

    let result = misconfigured.enqueue_export("a@x.com").await;
    assert!(matches!(
        result,
        Err(ProducerError::Broker(BrokerError::TopologyMismatch { .. }))
    ));

    assert!(
        eventually(|| pipeline.client.reconnect_cycles() == 1 && pipeline.client.is_ready()).await
    );
    assert_eq!(pipeline.broker.connection_count(), 1);
    assert!(eventually(|| pipeline.consumer.subscriptions() == 2).await);

    pipeline.producer.enqueue_export("b@x.com").await.unwrap();
    assert!(eventually(|| pipeline.consumer.acked() == 1).await);
    assert_eq!(pipeline.mailer.sent()[0].to, "b@x.com");
    assert_eq!(pipeline.broker.queue_depth("movie_exports"), 0);
}

#[tokio::test]
async fn test_enqueue_while_disconnected_is_service_unavailable() {
    let pipeline = Pipeline::start(RecordingMailer::new(), movies(1)).await;

    pipeline.broker.set_offline(true);
    pipeline.broker.drop_connections();
    assert!(eventually(|| !pipeline.client.is_ready()).await);

    let result = pipeline.producer.enqueue_export("a@x.com").await;

    assert!(matches!(result, Err(ProducerError::ServiceUnavailable(_))));
    assert_eq!(pipeline.mailer.attempts(), 0);
}

#[tokio::test]
async fn test_healthy_export_mails_header_and_three_rows() {
    let pipeline = Pipeline::start(RecordingMailer::new(), movies(3)).await;

    pipeline.producer.enqueue_export("a@x.com").await.unwrap();

    assert!(eventually(|| pipeline.consumer.acked() == 1).await);
    let sent = pipeline.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@x.com");
    assert_eq!(sent[0].filename, "movies.csv");

    let text = String::from_utf8(sent[0].content.clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], CSV_HEADERS.join(","));
    assert_eq!(
        lines[1],
        "1,Movie 1,Description 1,Director 1,2000-01-01,2024-02-03T04:05:06Z,2024-03-04T05:06:07Z"
    );
    assert!(lines[3].starts_with("3,Movie 3,"));

    assert_eq!(pipeline.broker.queue_depth("movie_exports"), 0);
    assert_eq!(pipeline.broker.queue_depth("movie_exports_failed"), 0);
    assert_eq!(files_in(pipeline.temp_dir.path()), 0);
}

#[tokio::test]
async fn test_failing_mailer_parks_job_in_dead_letter_queue() {
    let pipeline = Pipeline::start(RecordingMailer::failing("550 rejected"), movies(3)).await;

    pipeline.producer.enqueue_export("a@x.com").await.unwrap();

    assert!(eventually(|| pipeline.broker.queue_depth("movie_exports_failed") == 1).await);
    assert_eq!(pipeline.broker.queue_depth("movie_exports"), 0);
    assert!(pipeline.mailer.sent().is_empty());
}
