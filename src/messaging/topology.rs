//! Work queue and dead-letter topology.

use tracing::{debug, instrument};

use super::broker::{BrokerChannel, ExchangeType, QueueSpec};
use super::error::BrokerError;

/// Names making up the export queue topology.
///
/// The work queue dead-letters into `dead_letter_exchange` with
/// `dead_letter_routing_key`, and `dead_letter_queue` is bound to that
/// exchange by the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub work_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            work_queue: "movie_exports".to_string(),
            dead_letter_exchange: "dlx".to_string(),
            dead_letter_queue: "movie_exports_failed".to_string(),
            dead_letter_routing_key: "movie_exports_failed".to_string(),
        }
    }
}

impl QueueTopology {
    /// Check names are usable before touching the broker.
    pub fn validate(&self) -> Result<(), BrokerError> {
        for (field, value) in [
            ("work_queue", &self.work_queue),
            ("dead_letter_exchange", &self.dead_letter_exchange),
            ("dead_letter_queue", &self.dead_letter_queue),
            ("dead_letter_routing_key", &self.dead_letter_routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(BrokerError::topology_mismatch(field, "name must not be empty"));
            }
        }
        if self.dead_letter_routing_key == self.work_queue {
            return Err(BrokerError::topology_mismatch(
                &self.dead_letter_routing_key,
                "dead-letter routing key must differ from the work queue name",
            ));
        }
        if self.dead_letter_queue == self.work_queue {
            return Err(BrokerError::topology_mismatch(
                &self.dead_letter_queue,
                "dead-letter queue must differ from the work queue",
            ));
        }
        Ok(())
    }

    /// Declaration used for the work queue.
    pub fn work_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable()
            .with_dead_letter(&self.dead_letter_exchange, &self.dead_letter_routing_key)
    }
}

/// Declare the dead-letter exchange, the dead-letter queue and its binding,
/// then the work queue pointing at them.
///
/// Safe to repeat with identical parameters. Channel-scoped state does not
/// survive a reconnect, so this runs on every freshly opened channel before
/// it publishes or consumes.
#[instrument(skip(channel), fields(queue = %topology.work_queue))]
pub async fn assert_topology(
    channel: &dyn BrokerChannel,
    topology: &QueueTopology,
) -> Result<(), BrokerError> {
    topology.validate()?;

    channel
        .declare_exchange(&topology.dead_letter_exchange, ExchangeType::Direct, true)
        .await?;
    channel
        .declare_queue(&topology.dead_letter_queue, &QueueSpec::durable())
        .await?;
    channel
        .bind_queue(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            &topology.dead_letter_routing_key,
        )
        .await?;
    channel
        .declare_queue(&topology.work_queue, &topology.work_queue_spec())
        .await?;

    debug!(
        dlx = %topology.dead_letter_exchange,
        dlq = %topology.dead_letter_queue,
        "Topology asserted"
    );
    Ok(())
}
