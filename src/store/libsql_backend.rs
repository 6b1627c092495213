//! libSQL backend implementing the rule, recipient and outcome stores.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    DeliveryOutcome, OutcomeLog, OutcomeStatus, Recipient, RecipientStore, RoutingRule, RuleStore,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create a rule or change an existing rule's active flag.
    pub async fn upsert_rule(&self, keyword: &str, active: bool) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO forwarding_rules (keyword, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(keyword) DO UPDATE SET
                    active = excluded.active,
                    updated_at = excluded.updated_at",
                params![keyword, active as i64, now],
            )
            .await
            .map_err(|e| DatabaseError::from_write("upsert_rule", e))?;
        debug!(keyword, active, "Forwarding rule saved");
        Ok(())
    }

    /// All recipients, oldest first.
    pub async fn list_recipients(&self) -> Result<Vec<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recipients: {e}")))?;

        let mut recipients = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_recipient(&row) {
                Ok(r) => recipients.push(r),
                Err(e) => warn!("Skipping recipient row: {e}"),
            }
        }
        Ok(recipients)
    }

    /// Most recent delivery outcomes, newest first.
    pub async fn recent_outcomes(&self, limit: usize) -> Result<Vec<DeliveryOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, subject, from_email, recipient_id, status, error, forwarded_at
                 FROM email_logs ORDER BY id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_outcome(&row) {
                Ok(o) => outcomes.push(o),
                Err(e) => warn!("Skipping outcome row: {e}"),
            }
        }
        Ok(outcomes)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RECIPIENT_COLUMNS: &str = "id, name, email, created_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_recipient(row: &libsql::Row) -> Result<Recipient, libsql::Error> {
    let created_str: String = row.get(3)?;
    Ok(Recipient {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_outcome(row: &libsql::Row) -> Result<DeliveryOutcome, libsql::Error> {
    let status_str: String = row.get(4)?;
    let recorded_str: String = row.get(6)?;
    Ok(DeliveryOutcome {
        message_id: row.get(0)?,
        subject: row.get(1)?,
        sender: row.get(2)?,
        recipient_id: row.get(3)?,
        status: OutcomeStatus::parse(&status_str),
        error: row.get(5).ok(),
        recorded_at: parse_datetime(&recorded_str),
    })
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl RuleStore for LibSqlBackend {
    async fn list_active(&self) -> Result<Vec<RoutingRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT keyword FROM forwarding_rules WHERE active = 1 ORDER BY keyword",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active: {e}")))?;

        let mut rules = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let keyword: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                    rules.push(RoutingRule { keyword });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_active: {e}"))),
            }
        }
        Ok(rules)
    }
}

#[async_trait]
impl RecipientStore for LibSqlBackend {
    async fn find_by_address(&self, address: &str) -> Result<Option<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE email = ?1"),
                params![address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_address: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let recipient = row_to_recipient(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(recipient))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_address: {e}"))),
        }
    }

    async fn create(&self, name: &str, address: &str) -> Result<Recipient, DatabaseError> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO recipients (name, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![name, address, now_str],
        )
        .await
        .map_err(|e| DatabaseError::from_write("create_recipient", e))?;

        let id = conn.last_insert_rowid();
        info!(id, name, email = address, "Recipient created");
        Ok(Recipient {
            id,
            name: name.to_string(),
            email: address.to_string(),
            created_at: now,
        })
    }
}

#[async_trait]
impl OutcomeLog for LibSqlBackend {
    async fn append(&self, outcome: &DeliveryOutcome) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO email_logs
                    (message_id, subject, from_email, recipient_id, status, error, forwarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    outcome.message_id.as_str(),
                    outcome.subject.as_str(),
                    outcome.sender.as_str(),
                    outcome.recipient_id,
                    outcome.status.as_str(),
                    opt_text(outcome.error.as_deref()),
                    outcome.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("append_outcome", e))?;

        debug!(
            message_id = %outcome.message_id,
            status = outcome.status.as_str(),
            "Outcome recorded"
        );
        Ok(())
    }
}
