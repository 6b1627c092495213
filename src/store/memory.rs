//! In-memory store implementing the rule, recipient and outcome traits.
//!
//! Counts calls so tests can assert which collaborators a run touched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::DatabaseError;
use crate::store::traits::{
    DeliveryOutcome, OutcomeLog, Recipient, RecipientStore, RoutingRule, RuleStore,
};

#[derive(Debug, Default)]
struct State {
    rules: Vec<(String, bool)>,
    recipients: Vec<Recipient>,
    outcomes: Vec<DeliveryOutcome>,
    rule_loads: usize,
    lookups: usize,
    fail_rules: bool,
    fail_outcomes: bool,
}

/// Shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a rule.
    pub async fn set_rule(&self, keyword: &str, active: bool) {
        let mut state = self.state.lock().await;
        match state.rules.iter_mut().find(|(k, _)| k == keyword) {
            Some(rule) => rule.1 = active,
            None => state.rules.push((keyword.to_string(), active)),
        }
    }

    pub async fn set_fail_rules(&self, fail: bool) {
        self.state.lock().await.fail_rules = fail;
    }

    pub async fn set_fail_outcomes(&self, fail: bool) {
        self.state.lock().await.fail_outcomes = fail;
    }

    pub async fn recipients(&self) -> Vec<Recipient> {
        self.state.lock().await.recipients.clone()
    }

    pub async fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.state.lock().await.outcomes.clone()
    }

    /// Number of `list_active` calls.
    pub async fn rule_loads(&self) -> usize {
        self.state.lock().await.rule_loads
    }

    /// Number of `find_by_address` calls.
    pub async fn recipient_lookups(&self) -> usize {
        self.state.lock().await.lookups
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_active(&self) -> Result<Vec<RoutingRule>, DatabaseError> {
        let mut state = self.state.lock().await;
        state.rule_loads += 1;
        if state.fail_rules {
            return Err(DatabaseError::Query("rules table unavailable".into()));
        }
        Ok(state
            .rules
            .iter()
            .filter(|(_, active)| *active)
            .map(|(keyword, _)| RoutingRule {
                keyword: keyword.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl RecipientStore for MemoryStore {
    async fn find_by_address(&self, address: &str) -> Result<Option<Recipient>, DatabaseError> {
        let mut state = self.state.lock().await;
        state.lookups += 1;
        Ok(state.recipients.iter().find(|r| r.email == address).cloned())
    }

    async fn create(&self, name: &str, address: &str) -> Result<Recipient, DatabaseError> {
        let mut state = self.state.lock().await;
        if state.recipients.iter().any(|r| r.email == address) {
            return Err(DatabaseError::Constraint(format!(
                "UNIQUE constraint failed: recipients.email ({address})"
            )));
        }
        let recipient = Recipient {
            id: state.recipients.len() as i64 + 1,
            name: name.to_string(),
            email: address.to_string(),
            created_at: Utc::now(),
        };
        state.recipients.push(recipient.clone());
        Ok(recipient)
    }
}

#[async_trait]
impl OutcomeLog for MemoryStore {
    async fn append(&self, outcome: &DeliveryOutcome) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        if state.fail_outcomes {
            return Err(DatabaseError::Query("email_logs unavailable".into()));
        }
        state.outcomes.push(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rules_filter_inactive() {
        let store = MemoryStore::new();
        store.set_rule("invoices", true).await;
        store.set_rule("receipts", true).await;
        store.set_rule("receipts", false).await;

        let rules = store.list_active().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].keyword, "invoices");
        assert_eq!(store.rule_loads().await, 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_constraint() {
        let store = MemoryStore::new();
        store.create("ap", "ap@example.com").await.unwrap();
        let err = store.create("ap", "ap@example.com").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }
}
