//! In-memory mailbox: a `MailboxSource` backed by a shared vector.
//!
//! Used by tests and local dry runs. Supports failure injection for connect
//! and fetch, and counts sessions so callers can observe run exclusivity.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channels::mailbox::{MailboxSession, MailboxSource, Message, UnreadMessages};
use crate::error::MailboxError;

#[derive(Debug)]
struct StoredEntry {
    message: Message,
    seen: bool,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Option<StoredEntry>>,
    fail_connect: bool,
    fail_fetch: bool,
    connects: usize,
    disconnects: usize,
    open_sessions: usize,
    max_open_sessions: usize,
    mark_calls: Vec<String>,
}

/// Shared in-memory mailbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<State>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message into the mailbox as unread.
    pub async fn push(&self, message: Message) {
        self.state.lock().await.entries.push(Some(StoredEntry {
            message,
            seen: false,
        }));
    }

    /// Remove a message entirely, as if deleted by another client.
    pub async fn vanish(&self, message_id: &str) {
        let mut state = self.state.lock().await;
        for slot in state.entries.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.message.message_id == message_id) {
                *slot = None;
            }
        }
    }

    pub async fn set_fail_connect(&self, fail: bool) {
        self.state.lock().await.fail_connect = fail;
    }

    pub async fn set_fail_fetch(&self, fail: bool) {
        self.state.lock().await.fail_fetch = fail;
    }

    /// Whether the message is flagged consumed.
    pub async fn is_read(&self, message_id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .flatten()
            .any(|e| e.message.message_id == message_id && e.seen)
    }

    /// Ids of messages still unread.
    pub async fn unread_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .flatten()
            .filter(|e| !e.seen)
            .map(|e| e.message.message_id.clone())
            .collect()
    }

    pub async fn connect_count(&self) -> usize {
        self.state.lock().await.connects
    }

    pub async fn disconnect_count(&self) -> usize {
        self.state.lock().await.disconnects
    }

    /// Highest number of sessions that were open at the same time.
    pub async fn max_concurrent_sessions(&self) -> usize {
        self.state.lock().await.max_open_sessions
    }

    /// Every `mark_read` call, in order.
    pub async fn mark_calls(&self) -> Vec<String> {
        self.state.lock().await.mark_calls.clone()
    }
}

#[async_trait]
impl MailboxSource for MemoryMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let mut state = self.state.lock().await;
        if state.fail_connect {
            return Err(MailboxError::Connection {
                host: "memory".into(),
                reason: "connection refused".into(),
            });
        }
        state.connects += 1;
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    open: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), MailboxError> {
        if self.open {
            Ok(())
        } else {
            Err(MailboxError::Protocol("session is closed".into()))
        }
    }
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn fetch_unread(&mut self) -> Result<UnreadMessages, MailboxError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        if state.fail_fetch {
            return Err(MailboxError::Protocol("SEARCH failed".into()));
        }
        let keys = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|e| !e.seen))
            .map(|(i, _)| i as u32);
        Ok(UnreadMessages::new(keys))
    }

    async fn next_message(
        &mut self,
        unread: &mut UnreadMessages,
    ) -> Result<Option<Message>, MailboxError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        while let Some(key) = unread.next_key() {
            if let Some(Some(entry)) = state.entries.get(key as usize) {
                return Ok(Some(entry.message.clone()));
            }
        }
        Ok(None)
    }

    async fn mark_read(&mut self, message_id: &str) -> Result<(), MailboxError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state.mark_calls.push(message_id.to_string());
        let entry = state
            .entries
            .iter_mut()
            .flatten()
            .find(|e| e.message.message_id == message_id)
            .ok_or_else(|| MailboxError::NotFound {
                message_id: message_id.to_string(),
            })?;
        entry.seen = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MailboxError> {
        if self.open {
            self.open = false;
            let mut state = self.state.lock().await;
            state.disconnects += 1;
            state.open_sessions -= 1;
        }
        Ok(())
    }
}
