//! Enqueue side of the export pipeline.

use thiserror::Error;
use tracing::{info, instrument};

use crate::messaging::{assert_topology, BrokerClient, BrokerError, PublishProperties, QueueTopology};
use crate::types::{JobMessage, JobPayloadError};

#[derive(Debug, Error)]
pub enum ProducerError {
    /// No live channel. Nothing was queued.
    #[error("export service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    InvalidJob(#[from] JobPayloadError),

    #[error(transparent)]
    Broker(BrokerError),
}

impl From<BrokerError> for ProducerError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ServiceUnavailable(message) => ProducerError::ServiceUnavailable(message),
            other => ProducerError::Broker(other),
        }
    }
}

/// Publishes export jobs on the client's shared channel.
#[derive(Clone)]
pub struct ExportJobProducer {
    client: BrokerClient,
    topology: QueueTopology,
}

impl ExportJobProducer {
    pub fn new(client: BrokerClient, topology: QueueTopology) -> Self {
        Self { client, topology }
    }

    /// Queue an export for `admin_email`.
    ///
    /// Fails fast with [`ProducerError::ServiceUnavailable`] when the broker
    /// link is down.
    #[instrument(skip(self))]
    pub async fn enqueue_export(&self, admin_email: &str) -> Result<(), ProducerError> {
        let job = JobMessage::new(admin_email)?;
        let channel = self.client.channel()?;

        assert_topology(channel.as_ref(), &self.topology).await?;
        channel
            .publish(
                &self.topology.work_queue,
                &job.to_bytes()?,
                &PublishProperties::persistent_json(),
            )
            .await?;

        info!(queue = %self.topology.work_queue, "Export job queued");
        Ok(())
    }
}
