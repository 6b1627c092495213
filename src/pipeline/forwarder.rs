//! Forwarding run orchestration.
//!
//! One run: snapshot rules → connect → for each unread message
//! route → resolve → deliver → record → mark consumed → disconnect.
//! Runs are serialized by a per-forwarder lock; a caller arriving while a
//! run is active waits for it to finish, then runs its own.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::channels::mailbox::{MailboxSession, MailboxSource, Message};
use crate::config::{ProvisionPolicy, RelayConfig, UnmatchedPolicy};
use crate::error::RunError;
use crate::pipeline::compose::compose;
use crate::pipeline::delivery::{Deliverer, DeliveryTransport, RetryPolicy, Sleeper};
use crate::pipeline::recipients::{ProvisionBudget, RecipientDirectory};
use crate::pipeline::router::{RuleSnapshot, parse_subject};
use crate::store::{DeliveryOutcome, OutcomeLog, OutcomeStatus, RecipientStore, RuleStore};

/// Collaborators a forwarder runs against.
pub struct ForwarderDeps {
    pub mailbox: Arc<dyn MailboxSource>,
    pub rules: Arc<dyn RuleStore>,
    pub recipients: Arc<dyn RecipientStore>,
    pub outcomes: Arc<dyn OutcomeLog>,
    pub transport: Arc<dyn DeliveryTransport>,
    pub sleeper: Arc<dyn Sleeper>,
}

/// Forwarding behaviour knobs.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// From header of forwarded mail.
    pub from_address: String,
    pub retry: RetryPolicy,
    pub unmatched: UnmatchedPolicy,
    pub provisioning: ProvisionPolicy,
}

impl ForwarderSettings {
    pub fn new(from_address: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
            retry: RetryPolicy::default(),
            unmatched: UnmatchedPolicy::default(),
            provisioning: ProvisionPolicy::default(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            from_address: config.smtp.from_address.clone(),
            retry: config.retry,
            unmatched: config.unmatched,
            provisioning: config.provisioning.clone(),
        }
    }
}

/// Per-run counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Messages fetched from the mailbox.
    pub fetched: usize,
    pub forwarded: usize,
    /// Delivery exhausted its attempts.
    pub failed: usize,
    /// Subject did not parse as `keyword - destination`.
    pub unroutable: usize,
    /// Keyword had no active rule.
    pub no_rule: usize,
    /// Destination could not be resolved to a recipient.
    pub unresolved: usize,
    pub mark_failures: usize,
}

impl RunSummary {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Unroutable => self.unroutable += 1,
            Disposition::NoRule => self.no_rule += 1,
            Disposition::Unresolved => self.unresolved += 1,
            Disposition::Delivered => self.forwarded += 1,
            Disposition::Failed => self.failed += 1,
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Unroutable,
    NoRule,
    Unresolved,
    Delivered,
    Failed,
}

impl Disposition {
    /// Whether a delivery was attempted (and an outcome recorded).
    fn attempted(self) -> bool {
        matches!(self, Disposition::Delivered | Disposition::Failed)
    }
}

/// The forwarding pipeline. Share it behind an `Arc`; `run_now` is the only entry point.
pub struct Forwarder {
    mailbox: Arc<dyn MailboxSource>,
    rules: Arc<dyn RuleStore>,
    outcomes: Arc<dyn OutcomeLog>,
    directory: RecipientDirectory,
    deliverer: Deliverer,
    settings: ForwarderSettings,
    run_lock: Mutex<()>,
}

impl Forwarder {
    pub fn new(deps: ForwarderDeps, settings: ForwarderSettings) -> Self {
        Self {
            mailbox: deps.mailbox,
            rules: deps.rules,
            outcomes: deps.outcomes,
            directory: RecipientDirectory::new(deps.recipients, settings.provisioning.clone()),
            deliverer: Deliverer::new(deps.transport, deps.sleeper, settings.retry),
            settings,
            run_lock: Mutex::new(()),
        }
    }

    /// Execute one forwarding run over all currently unread messages.
    ///
    /// Waits for any run already in progress. Rule-load, connect and fetch
    /// failures abort the rest of the run; messages already handled stay handled.
    pub async fn run_now(&self) -> Result<RunSummary, RunError> {
        let _guard = self.run_lock.lock().await;
        let span = info_span!("forwarding_run", run = %Uuid::new_v4());
        self.run_exclusive().instrument(span).await
    }

    /// Wait until no run is in progress or queued ahead of this call.
    pub async fn wait_idle(&self) {
        drop(self.run_lock.lock().await);
    }

    async fn run_exclusive(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();

        let snapshot = RuleSnapshot::load(self.rules.as_ref())
            .await
            .map_err(RunError::RuleLoad)?;
        debug!(rules = snapshot.len(), "Loaded rule snapshot");

        let mut session = self.mailbox.connect().await.map_err(RunError::Connect)?;
        let result = self.drain(session.as_mut(), &snapshot).await;
        if let Err(e) = session.disconnect().await {
            warn!(error = %e, "Mailbox disconnect failed");
        }

        let summary = result?;
        info!(
            fetched = summary.fetched,
            forwarded = summary.forwarded,
            failed = summary.failed,
            unroutable = summary.unroutable,
            no_rule = summary.no_rule,
            unresolved = summary.unresolved,
            mark_failures = summary.mark_failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Forwarding run complete"
        );
        Ok(summary)
    }

    /// Process unread messages strictly in enumeration order.
    async fn drain(
        &self,
        session: &mut dyn MailboxSession,
        snapshot: &RuleSnapshot,
    ) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::default();
        let mut unread = session.fetch_unread().await.map_err(RunError::Fetch)?;
        if unread.is_empty() {
            debug!("No unread messages");
            return Ok(summary);
        }
        let mut budget = self.directory.budget();

        while let Some(message) = session
            .next_message(&mut unread)
            .await
            .map_err(RunError::Fetch)?
        {
            summary.fetched += 1;
            let disposition = self.process(&message, snapshot, &mut budget).await;
            summary.record(&disposition);

            if disposition.attempted() || self.settings.unmatched == UnmatchedPolicy::MarkRead {
                if let Err(e) = session.mark_read(&message.message_id).await {
                    summary.mark_failures += 1;
                    warn!(message_id = %message.message_id, error = %e, "Failed to mark message read");
                }
            }
        }
        Ok(summary)
    }

    async fn process(
        &self,
        message: &Message,
        snapshot: &RuleSnapshot,
        budget: &mut ProvisionBudget,
    ) -> Disposition {
        let message_id = message.message_id.as_str();

        let Some(route) = parse_subject(&message.subject) else {
            debug!(message_id, subject = %message.subject, "Subject is not a route");
            return Disposition::Unroutable;
        };

        if !snapshot.allows(&route.keyword) {
            info!(message_id, keyword = %route.keyword, "No active rule for keyword");
            return Disposition::NoRule;
        }

        let recipient = match self
            .directory
            .resolve_or_create(&route.destination, budget)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    message_id,
                    destination = %route.destination,
                    error = %e,
                    "Could not resolve recipient"
                );
                return Disposition::Unresolved;
            }
        };

        let result = match compose(message, &recipient.email, &self.settings.from_address) {
            Ok(composed) => self.deliverer.deliver(&recipient.email, &composed).await,
            Err(e) => Err(e),
        };

        let (disposition, status, error_detail) = match result {
            Ok(attempts) => {
                info!(
                    message_id,
                    keyword = %route.keyword,
                    destination = %recipient.email,
                    attempts,
                    "Message forwarded"
                );
                (Disposition::Delivered, OutcomeStatus::Success, None)
            }
            Err(e) => {
                error!(
                    message_id,
                    destination = %recipient.email,
                    error = %e,
                    "Forward failed"
                );
                (Disposition::Failed, OutcomeStatus::Failed, Some(e.to_string()))
            }
        };

        let outcome = DeliveryOutcome {
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipient_id: recipient.id,
            status,
            error: error_detail,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.outcomes.append(&outcome).await {
            warn!(message_id, error = %e, "Failed to record delivery outcome");
        }

        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::memory::MemoryMailbox;
    use crate::error::DeliveryError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryTransport for RecordingTransport {
        async fn submit(&self, message: &lettre::Message) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Transport("relay refused".into()));
            }
            let to = message
                .envelope()
                .to()
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.sent.lock().unwrap().push(to);
            Ok(())
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    struct Harness {
        mailbox: MemoryMailbox,
        store: MemoryStore,
        transport: Arc<RecordingTransport>,
        forwarder: Forwarder,
    }

    fn harness(transport: RecordingTransport, settings: ForwarderSettings) -> Harness {
        let mailbox = MemoryMailbox::new();
        let store = MemoryStore::new();
        let transport = Arc::new(transport);
        let forwarder = Forwarder::new(
            ForwarderDeps {
                mailbox: Arc::new(mailbox.clone()),
                rules: Arc::new(store.clone()),
                recipients: Arc::new(store.clone()),
                outcomes: Arc::new(store.clone()),
                transport: transport.clone(),
                sleeper: Arc::new(NoSleep),
            },
            settings,
        );
        Harness {
            mailbox,
            store,
            transport,
            forwarder,
        }
    }

    fn settings() -> ForwarderSettings {
        ForwarderSettings::new("relay@example.com")
    }

    #[tokio::test]
    async fn forwards_matching_message() {
        let h = harness(RecordingTransport::default(), settings());
        h.store.set_rule("invoices", true).await;
        h.mailbox
            .push(Message::new("m1", "invoices - ap@example.com", "alice@example.com").with_text("hi"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.forwarded, 1);
        assert_eq!(*h.transport.sent.lock().unwrap(), vec!["ap@example.com"]);
        assert!(h.mailbox.is_read("m1").await);

        let outcomes = h.store.outcomes().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Success);
        assert_eq!(outcomes[0].sender, "alice@example.com");
    }

    #[tokio::test]
    async fn empty_mailbox_completes_cleanly() {
        let h = harness(RecordingTransport::default(), settings());
        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(h.mailbox.disconnect_count().await, 1);
    }

    #[tokio::test]
    async fn rule_miss_is_marked_read_by_default() {
        let h = harness(RecordingTransport::default(), settings());
        h.mailbox
            .push(Message::new("m1", "receipts - ap@example.com", "a@b.com"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.no_rule, 1);
        assert!(h.mailbox.is_read("m1").await);
        assert!(h.store.outcomes().await.is_empty());
        assert_eq!(h.store.recipient_lookups().await, 0);
    }

    #[tokio::test]
    async fn leave_unread_policy_keeps_unmatched_messages() {
        let mut s = settings();
        s.unmatched = UnmatchedPolicy::LeaveUnread;
        let h = harness(RecordingTransport::default(), s);
        h.store.set_rule("invoices", true).await;
        h.mailbox.push(Message::new("plain", "hello there", "a@b.com")).await;
        h.mailbox
            .push(Message::new("miss", "receipts - ap@example.com", "a@b.com"))
            .await;
        h.mailbox
            .push(Message::new("hit", "invoices - ap@example.com", "a@b.com"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.unroutable, 1);
        assert_eq!(summary.no_rule, 1);
        assert_eq!(summary.forwarded, 1);
        assert_eq!(h.mailbox.unread_ids().await, vec!["plain", "miss"]);

        // A rule added later picks the message up on the next run.
        h.store.set_rule("receipts", true).await;
        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert_eq!(h.mailbox.unread_ids().await, vec!["plain"]);
    }

    #[tokio::test]
    async fn failed_delivery_is_recorded_and_marked_read() {
        let h = harness(
            RecordingTransport {
                fail: true,
                ..Default::default()
            },
            settings(),
        );
        h.store.set_rule("invoices", true).await;
        h.mailbox
            .push(Message::new("m1", "invoices - ap@example.com", "a@b.com"))
            .await;
        h.mailbox
            .push(Message::new("m2", "invoices - books@example.com", "a@b.com"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.failed, 2);
        assert!(h.mailbox.unread_ids().await.is_empty());

        let outcomes = h.store.outcomes().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Failed));
        assert!(outcomes[0].error.as_deref().unwrap().contains("relay refused"));
    }

    #[tokio::test]
    async fn unresolved_recipient_is_skipped_without_record() {
        let mut s = settings();
        s.provisioning.allowed_destinations = vec!["@example.com".into()];
        let h = harness(RecordingTransport::default(), s);
        h.store.set_rule("invoices", true).await;
        h.mailbox
            .push(Message::new("m1", "invoices - x@elsewhere.net", "a@b.com"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.unresolved, 1);
        assert!(h.transport.sent.lock().unwrap().is_empty());
        assert!(h.store.outcomes().await.is_empty());
        assert!(h.store.recipients().await.is_empty());
    }

    #[tokio::test]
    async fn rule_load_failure_aborts_before_connect() {
        let h = harness(RecordingTransport::default(), settings());
        h.store.set_fail_rules(true).await;

        let err = h.forwarder.run_now().await.unwrap_err();
        assert!(matches!(err, RunError::RuleLoad(_)));
        assert_eq!(h.mailbox.connect_count().await, 0);
    }

    #[tokio::test]
    async fn connect_failure_is_run_error() {
        let h = harness(RecordingTransport::default(), settings());
        h.mailbox.set_fail_connect(true).await;
        let err = h.forwarder.run_now().await.unwrap_err();
        assert!(matches!(err, RunError::Connect(_)));
    }

    #[tokio::test]
    async fn fetch_failure_still_disconnects() {
        let h = harness(RecordingTransport::default(), settings());
        h.mailbox.set_fail_fetch(true).await;

        let err = h.forwarder.run_now().await.unwrap_err();
        assert!(matches!(err, RunError::Fetch(_)));
        assert_eq!(h.mailbox.connect_count().await, 1);
        assert_eq!(h.mailbox.disconnect_count().await, 1);
    }

    #[tokio::test]
    async fn outcome_log_failure_does_not_abort_run() {
        let h = harness(RecordingTransport::default(), settings());
        h.store.set_rule("invoices", true).await;
        h.store.set_fail_outcomes(true).await;
        h.mailbox
            .push(Message::new("m1", "invoices - ap@example.com", "a@b.com"))
            .await;

        let summary = h.forwarder.run_now().await.unwrap();
        assert_eq!(summary.forwarded, 1);
        assert!(h.mailbox.is_read("m1").await);
    }

    #[test]
    fn summary_serializes_counts() {
        let summary = RunSummary {
            fetched: 3,
            forwarded: 1,
            no_rule: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["fetched"], 3);
        assert_eq!(json["forwarded"], 1);
        assert_eq!(json["no_rule"], 2);
        assert_eq!(json["mark_failures"], 0);
    }
}
