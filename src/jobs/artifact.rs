//! Temporary storage for a rendered export.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// A rendered export written to a temporary file.
///
/// Released explicitly with [`ExportArtifact::release`]; if the owning
/// future is dropped first (timeout, cancellation) the file is removed on
/// drop instead. Removal failures are logged and never returned.
#[derive(Debug)]
pub struct ExportArtifact {
    path: Option<PathBuf>,
    len: usize,
}

impl ExportArtifact {
    /// Write `content` to a fresh file under `dir`.
    pub async fn write(dir: &Path, content: &[u8]) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("movies-{}.csv", Uuid::new_v4()));
        // Guard first so a partial write is removed too.
        let artifact = Self {
            path: Some(path.clone()),
            len: content.len(),
        };
        tokio::fs::write(&path, content).await?;

        debug!(path = %path.display(), bytes = content.len(), "Export artifact written");
        Ok(artifact)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bytes written.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Read the stored content back.
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        match &self.path {
            Some(path) => tokio::fs::read(path).await,
            None => Err(io::Error::new(io::ErrorKind::NotFound, "artifact released")),
        }
    }

    /// Delete the file.
    pub async fn release(mut self) {
        if let Some(path) = self.path.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Export artifact released"),
                Err(e) => log_cleanup_failure(&path, &e),
            }
        }
    }
}

impl Drop for ExportArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log_cleanup_failure(&path, &e);
            }
        }
    }
}

fn log_cleanup_failure(path: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::NotFound {
        return;
    }
    warn!(path = %path.display(), error = %error, "Failed to clean up export artifact");
}
