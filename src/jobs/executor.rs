//! Export executor: load, render, mail, clean up.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, instrument};

use super::artifact::ExportArtifact;
use super::consumer::{JobFailure, JobHandler};
use super::render::render_csv;
use crate::output::ExportMailer;
use crate::repository::MovieSource;
use crate::types::JobMessage;

/// Attachment name of the exported file.
pub const EXPORT_FILENAME: &str = "movies.csv";

/// Step at which an export failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Load,
    Render,
    Delivery,
    Timeout,
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExportStage::Load => "load",
            ExportStage::Render => "render",
            ExportStage::Delivery => "delivery",
            ExportStage::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("export failed at {stage}: {message}")]
pub struct ExportError {
    pub stage: ExportStage,
    pub message: String,
}

impl ExportError {
    pub fn new(stage: ExportStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    pub bytes: usize,
}

/// Runs one export per job.
pub struct ExportExecutor {
    movies: Arc<dyn MovieSource>,
    mailer: Arc<dyn ExportMailer>,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl ExportExecutor {
    pub fn new(
        movies: Arc<dyn MovieSource>,
        mailer: Arc<dyn ExportMailer>,
        temp_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            movies,
            mailer,
            temp_dir: temp_dir.into(),
            timeout,
        }
    }

    /// Export every movie and mail the CSV to `admin_email`.
    ///
    /// The temporary file is gone when this returns, whatever the outcome.
    #[instrument(skip(self))]
    pub async fn run(&self, admin_email: &str) -> Result<ExportSummary, ExportError> {
        match tokio::time::timeout(self.timeout, self.export(admin_email)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::new(
                ExportStage::Timeout,
                format!("export exceeded {:?}", self.timeout),
            )),
        }
    }

    async fn export(&self, admin_email: &str) -> Result<ExportSummary, ExportError> {
        info!("Starting CSV export");

        let movies = self
            .movies
            .load_all_exportable()
            .await
            .map_err(|e| ExportError::new(ExportStage::Load, e.to_string()))?;
        info!(count = movies.len(), "Loaded movies to export");

        let csv = render_csv(&movies)
            .map_err(|e| ExportError::new(ExportStage::Render, e.to_string()))?;

        let artifact = ExportArtifact::write(&self.temp_dir, &csv)
            .await
            .map_err(|e| ExportError::new(ExportStage::Render, e.to_string()))?;

        let summary = ExportSummary {
            records: movies.len(),
            bytes: artifact.len(),
        };
        let delivered = self.deliver(admin_email, &artifact).await;
        artifact.release().await;
        delivered?;

        Ok(summary)
    }

    async fn deliver(
        &self,
        admin_email: &str,
        artifact: &ExportArtifact,
    ) -> Result<(), ExportError> {
        let content = artifact
            .read()
            .await
            .map_err(|e| ExportError::new(ExportStage::Render, e.to_string()))?;

        self.mailer
            .send_with_attachment(admin_email, EXPORT_FILENAME, &content)
            .await
            .map_err(|e| ExportError::new(ExportStage::Delivery, e.to_string()))
    }
}

#[async_trait]
impl JobHandler for ExportExecutor {
    async fn handle(&self, job: &JobMessage) -> Result<(), JobFailure> {
        match self.run(job.admin_email()).await {
            Ok(summary) => {
                info!(
                    admin_email = %job.admin_email(),
                    records = summary.records,
                    bytes = summary.bytes,
                    "Export delivered"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    admin_email = %job.admin_email(),
                    stage = %e.stage,
                    error = %e.message,
                    "Export failed"
                );
                Err(JobFailure::Export(e))
            }
        }
    }
}
