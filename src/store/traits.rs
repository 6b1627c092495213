//! Persistence collaborators consumed by the forwarding pipeline.
//!
//! Rules are read-only, recipients may be created but never mutated, and
//! delivery outcomes are append-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// An active keyword rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub keyword: String,
}

/// A stored forwarding recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Disposition of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => OutcomeStatus::Success,
            _ => OutcomeStatus::Failed,
        }
    }
}

/// Write-once audit record for one processed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipient_id: i64,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Source of active routing rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_active(&self) -> Result<Vec<RoutingRule>, DatabaseError>;
}

/// Recipient lookup and creation.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Exact lookup by email address.
    async fn find_by_address(&self, address: &str) -> Result<Option<Recipient>, DatabaseError>;

    /// Persist a new recipient. Fails with `DatabaseError::Constraint` if the
    /// address already exists.
    async fn create(&self, name: &str, address: &str) -> Result<Recipient, DatabaseError>;
}

/// Append-only delivery outcome log. Never read by the pipeline.
#[async_trait]
pub trait OutcomeLog: Send + Sync {
    async fn append(&self, outcome: &DeliveryOutcome) -> Result<(), DatabaseError>;
}
