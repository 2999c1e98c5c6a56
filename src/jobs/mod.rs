//! Export job processing: enqueue, consume, execute.

mod artifact;
mod consumer;
mod executor;
mod producer;
mod render;

pub use artifact::ExportArtifact;
pub use consumer::{
    disposition, startup_backoff, ConsumerError, ConsumerSubscription, Disposition,
    ExportConsumer, JobFailure, JobHandler, CONSUMER_PREFETCH,
};
pub use executor::{ExportError, ExportExecutor, ExportStage, ExportSummary, EXPORT_FILENAME};
pub use producer::{ExportJobProducer, ProducerError};
pub use render::{render_csv, RenderError, CSV_HEADERS};
