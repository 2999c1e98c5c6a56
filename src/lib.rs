//! Movie Export Service Library
//!
//! Durable, queue-backed export pipeline. An HTTP request enqueues a job on
//! RabbitMQ; a supervised consumer renders all movies to CSV, mails the file
//! to the requesting administrator and dead-letters jobs that fail.

use std::time::Duration;

pub mod api;
pub mod clock;
pub mod jobs;
pub mod messaging;
pub mod output;
pub mod repository;
pub mod types;

pub use clock::{Clock, RecordingClock, TokioClock};
pub use jobs::{ExportConsumer, ExportExecutor, ExportJobProducer};
pub use messaging::{BrokerClient, BrokerError, ConnectionState, QueueTopology};
pub use types::{JobMessage, MovieRecord, ServiceConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::*;
    pub use crate::jobs::*;
    pub use crate::messaging::{
        assert_topology, BrokerClient, BrokerError, ConnectionState, QueueTopology,
    };
    pub use crate::output::{ExportMailer, MailError};
    pub use crate::repository::{MovieSource, RepositoryError};
    pub use crate::types::*;
}

/// Wait after losing the broker before a reconnect cycle starts
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// Connect attempts per reconnect cycle
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Delay between connect attempts within a cycle
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Delay before the consumer re-subscribes after losing its channel
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on a single export run (5 minutes)
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);
