//! Recipient directory: resolves destinations to stored recipients,
//! auto-provisioning unknown ones within the configured policy.

use std::sync::Arc;

use tracing::info;

use crate::config::ProvisionPolicy;
use crate::error::RecipientError;
use crate::store::{Recipient, RecipientStore};

/// Remaining auto-provision allowance for one run.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionBudget {
    remaining: usize,
    limit: usize,
}

impl ProvisionBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: limit,
            limit,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

pub struct RecipientDirectory {
    store: Arc<dyn RecipientStore>,
    policy: ProvisionPolicy,
}

impl RecipientDirectory {
    pub fn new(store: Arc<dyn RecipientStore>, policy: ProvisionPolicy) -> Self {
        Self { store, policy }
    }

    /// Start a fresh per-run allowance.
    pub fn budget(&self) -> ProvisionBudget {
        ProvisionBudget::new(self.policy.max_new_per_run)
    }

    /// Exact lookup by address; on miss, create a recipient named after the
    /// address's local part.
    ///
    /// Existing recipients always resolve. New ones must pass the allow-list
    /// and fit within `budget`.
    pub async fn resolve_or_create(
        &self,
        address: &str,
        budget: &mut ProvisionBudget,
    ) -> Result<Recipient, RecipientError> {
        if let Some(existing) = self.store.find_by_address(address).await? {
            return Ok(existing);
        }

        if !is_address_allowed(&self.policy.allowed_destinations, address) {
            return Err(RecipientError::Rejected {
                address: address.to_string(),
                reason: "not in allowed destinations".into(),
            });
        }
        if budget.remaining == 0 {
            return Err(RecipientError::ProvisionLimit {
                limit: budget.limit,
            });
        }

        let name = display_name(address);
        let recipient = self.store.create(name, address).await?;
        budget.remaining -= 1;
        info!(recipient_id = recipient.id, email = address, "Auto-provisioned recipient");
        Ok(recipient)
    }
}

/// Substring before `@`, or the whole address if there is none.
pub fn display_name(address: &str) -> &str {
    address.split_once('@').map_or(address, |(local, _)| local)
}

/// Check an address against an allow-list.
///
/// - `*` allows everything
/// - `@example.com` or `example.com` allows that domain
/// - `user@example.com` allows that exact address (case-insensitive)
/// - an empty list denies everything
pub fn is_address_allowed(allowed: &[String], address: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let address_lower = address.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            address_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(address)
        } else {
            address_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}
