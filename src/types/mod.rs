//! Core types for the export service.

mod config;
mod job;
mod movie;

pub use config::{
    AuthConfig, BrokerConfig, ConfigError, ConsumerConfig, DatabaseConfig, ReconnectPolicy,
    ServiceConfig, SmtpConfig,
};
pub use job::{JobMessage, JobPayloadError, JOB_CONTENT_TYPE};
pub use movie::MovieRecord;
