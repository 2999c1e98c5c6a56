//! Email delivery of export attachments.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::types::SmtpConfig;

/// Subject line of export emails.
pub const EXPORT_SUBJECT: &str = "Movies Export";

/// HTML body of export emails.
pub const EXPORT_BODY_HTML: &str = "<p>Please find attached the exported movies data.</p>";

/// Errors from sending mail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailError {
    #[error("invalid address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("mail transport error: {0}")]
    Transport(String),
}

/// Sends an export file to a recipient. Best effort: no retries.
#[async_trait]
pub trait ExportMailer: Send + Sync {
    async fn send_with_attachment(
        &self,
        to: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), MailError>;
}

/// SMTP mailer over `lettre`.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from = parse_mailbox(&config.from)?;

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(host = %config.host, port = config.port, "SMTP mailer configured");

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|e: lettre::address::AddressError| MailError::InvalidAddress {
        address: address.to_string(),
        message: e.to_string(),
    })
}

/// Build the export message carrying `content` as a CSV attachment.
pub fn export_message(
    from: Mailbox,
    to: &str,
    filename: &str,
    content: &[u8],
) -> Result<Message, MailError> {
    let csv = ContentType::parse("text/csv").map_err(|e| MailError::Build(e.to_string()))?;

    Message::builder()
        .from(from)
        .to(parse_mailbox(to)?)
        .subject(EXPORT_SUBJECT)
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::html(EXPORT_BODY_HTML.to_string()))
                .singlepart(Attachment::new(filename.to_string()).body(content.to_vec(), csv)),
        )
        .map_err(|e| MailError::Build(e.to_string()))
}

#[async_trait]
impl ExportMailer for SmtpMailer {
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    async fn send_with_attachment(
        &self,
        to: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), MailError> {
        let message = export_message(self.from.clone(), to, filename, content)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        debug!(code = %response.code(), "Export email accepted");
        Ok(())
    }
}

/// A mail captured by [`RecordingMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub filename: String,
    pub content: Vec<u8>,
}

/// Mailer that keeps sent mail in memory and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    attempts: Mutex<u32>,
    failure: Mutex<Option<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailer whose every send fails with `message`.
    pub fn failing(message: &str) -> Self {
        let mailer = Self::default();
        mailer.set_failure(Some(message));
        mailer
    }

    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }

    /// Successfully sent mail.
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }

    /// Send calls, successful or not.
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[async_trait]
impl ExportMailer for RecordingMailer {
    async fn send_with_attachment(
        &self,
        to: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), MailError> {
        *self.attempts.lock() += 1;
        if let Some(message) = self.failure.lock().clone() {
            return Err(MailError::Transport(message));
        }
        self.sent.lock().push(SentMail {
            to: to.to_string(),
            filename: filename.to_string(),
            content: content.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_message_carries_csv_attachment() {
        let from: Mailbox = "\"Movies App\" <movies@example.com>".parse().unwrap();
        let message = export_message(from, "admin@example.com", "movies.csv", b"ID\n1\n").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: Movies Export"));
        assert!(raw.contains("To: admin@example.com"));
        assert!(raw.contains("text/csv"));
        assert!(raw.contains("movies.csv"));
        assert!(raw.contains("Please find attached the exported movies data."));
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let from: Mailbox = "movies@example.com".parse().unwrap();
        let result = export_message(from, "not an address", "movies.csv", b"");
        assert!(matches!(result, Err(MailError::InvalidAddress { .. })));
    }

    #[tokio::test]
    async fn test_recording_mailer_counts_failed_attempts() {
        let mailer = RecordingMailer::failing("smtp down");
        let result = mailer
            .send_with_attachment("a@x.com", "movies.csv", b"data")
            .await;

        assert!(matches!(result, Err(MailError::Transport(_))));
        assert_eq!(mailer.attempts(), 1);
        assert!(mailer.sent().is_empty());
    }
}
