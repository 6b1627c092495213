//! Error types for the mail relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Recipient error: {0}")]
    Recipient(#[from] RecipientError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// Uniqueness or other constraint violation on write.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Classify a libSQL error from a write, separating constraint violations.
    pub(crate) fn from_write(context: &str, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        if message.contains("constraint failed") {
            DatabaseError::Constraint(format!("{context}: {message}"))
        } else {
            DatabaseError::Query(format!("{context}: {message}"))
        }
    }
}

/// Mailbox source errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("Authentication failed for {username}")]
    AuthFailed { username: String },

    #[error("Mailbox operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Message {message_id} not found in mailbox")]
    NotFound { message_id: String },
}

impl From<std::io::Error> for MailboxError {
    fn from(err: std::io::Error) -> Self {
        MailboxError::Protocol(format!("IO error: {err}"))
    }
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to compose forward: {0}")]
    Compose(String),

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Delivery failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<DeliveryError>,
    },
}

/// Recipient resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum RecipientError {
    #[error("Destination {address} rejected: {reason}")]
    Rejected { address: String, reason: String },

    #[error("Auto-provision limit of {limit} new recipients per run reached")]
    ProvisionLimit { limit: usize },

    #[error("Recipient store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Run-level failures that abort the remainder of a forwarding run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to load forwarding rules: {0}")]
    RuleLoad(#[source] DatabaseError),

    #[error("Failed to connect to mailbox: {0}")]
    Connect(#[source] MailboxError),

    #[error("Failed to fetch unread messages: {0}")]
    Fetch(#[source] MailboxError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
