//! Output module for delivering exports to recipients.

mod email_client;

pub use email_client::{
    export_message, ExportMailer, MailError, RecordingMailer, SentMail, SmtpMailer,
    EXPORT_BODY_HTML, EXPORT_SUBJECT,
};
