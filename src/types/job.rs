//! Export job payload carried on the work queue.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern is valid");
}

/// Content type of every job message body.
pub const JOB_CONTENT_TYPE: &str = "application/json";

/// Reasons a job payload is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobPayloadError {
    #[error("admin email is empty")]
    EmptyAddress,

    #[error("admin email is not a valid address: {0}")]
    InvalidAddress(String),

    #[error("malformed job payload: {0}")]
    Malformed(String),
}

/// Request to export all movies and mail them to an administrator.
///
/// Serialized as `{"adminEmail": "..."}`. Construction always validates the
/// address, so a `JobMessage` in hand is known to be well formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(rename = "adminEmail")]
    admin_email: String,
}

impl JobMessage {
    /// Build a message for `admin_email`, trimming surrounding whitespace.
    pub fn new(admin_email: impl Into<String>) -> Result<Self, JobPayloadError> {
        let admin_email = admin_email.into().trim().to_string();
        validate_address(&admin_email)?;
        Ok(Self { admin_email })
    }

    /// Recipient of the export.
    pub fn admin_email(&self) -> &str {
        &self.admin_email
    }

    /// Encode as the UTF-8 JSON message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, JobPayloadError> {
        serde_json::to_vec(self).map_err(|e| JobPayloadError::Malformed(e.to_string()))
    }

    /// Decode and validate a message body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, JobPayloadError> {
        let raw: JobMessage =
            serde_json::from_slice(body).map_err(|e| JobPayloadError::Malformed(e.to_string()))?;
        Self::new(raw.admin_email)
    }
}

fn validate_address(address: &str) -> Result<(), JobPayloadError> {
    if address.is_empty() {
        return Err(JobPayloadError::EmptyAddress);
    }
    if !EMAIL_RE.is_match(address) {
        return Err(JobPayloadError::InvalidAddress(address.to_string()));
    }
    Ok(())
}
