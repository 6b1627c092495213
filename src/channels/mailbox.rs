//! Mailbox source abstraction read by the forwarding pipeline.
//!
//! A `MailboxSource` opens sessions; a `MailboxSession` enumerates unread
//! messages lazily, marks them consumed, and is released with `disconnect()`.

use std::collections::VecDeque;

use async_trait::async_trait;
use mail_parser::{MessageParser, PartType};

use crate::error::MailboxError;

/// Placeholder used for the outgoing text part when a message has no plaintext body.
pub const NO_PLAINTEXT_PLACEHOLDER: &str = "(this message has no plain-text content)";

/// A fetched inbound message. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable id (the `Message-ID` header, or a mailbox-derived fallback).
    pub message_id: String,
    pub subject: String,
    /// Sender address.
    pub sender: String,
    /// Sender display name, if the header carried one.
    pub sender_name: Option<String>,
    /// Original recipient (first `To` address).
    pub to: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl Message {
    /// Build a message with only the routing-relevant fields set.
    pub fn new(
        message_id: impl Into<String>,
        subject: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            subject: subject.into(),
            sender: sender.into(),
            sender_name: None,
            to: String::new(),
            text: None,
            html: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Sender formatted as `Name <address>` when a name is known.
    pub fn sender_display(&self) -> String {
        match &self.sender_name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.sender),
            _ => self.sender.clone(),
        }
    }

    /// Text for the outgoing plaintext part.
    pub fn text_or_placeholder(&self) -> &str {
        match self.text.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => NO_PLAINTEXT_PLACEHOLDER,
        }
    }

    /// Parse a raw RFC 5322 message. Returns `None` if it cannot be parsed.
    ///
    /// `fallback_id` is used when the message has no `Message-ID` header.
    pub fn parse(raw: &[u8], fallback_id: impl FnOnce() -> String) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let (sender, sender_name) = parsed
            .from()
            .and_then(|addr| addr.first())
            .map(|a| {
                (
                    a.address().unwrap_or_default().to_string(),
                    a.name().map(|n| n.to_string()),
                )
            })
            .unwrap_or_else(|| ("unknown".to_string(), None));

        let to = parsed
            .to()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .unwrap_or_default()
            .to_string();

        Some(Self {
            message_id: parsed
                .message_id()
                .map(|s| s.to_string())
                .unwrap_or_else(fallback_id),
            subject: parsed.subject().unwrap_or_default().to_string(),
            sender,
            sender_name,
            to,
            text: extract_plaintext(&parsed),
            html: extract_html(&parsed),
        })
    }
}

/// First genuine `text/plain` body part. HTML-only messages yield `None`.
fn extract_plaintext(parsed: &mail_parser::Message) -> Option<String> {
    parsed.text_bodies().find_map(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    })
}

/// First `text/html` body part.
fn extract_html(parsed: &mail_parser::Message) -> Option<String> {
    parsed.html_bodies().find_map(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    })
}

/// Unread messages found by a session, consumed one at a time.
///
/// The cursor is not restartable: each key is handed out once.
#[derive(Debug, Default)]
pub struct UnreadMessages {
    pending: VecDeque<u32>,
}

impl UnreadMessages {
    pub fn new(keys: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pending: keys.into_iter().collect(),
        }
    }

    /// Messages not yet handed out.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the next mailbox key.
    pub fn next_key(&mut self) -> Option<u32> {
        self.pending.pop_front()
    }
}

/// Opens authenticated mailbox sessions.
#[async_trait]
pub trait MailboxSource: Send + Sync {
    /// Establish an authenticated session over an encrypted channel.
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An open mailbox session. Must be released with `disconnect()`.
#[async_trait]
pub trait MailboxSession: Send {
    /// Find unread messages. An empty result is not an error.
    async fn fetch_unread(&mut self) -> Result<UnreadMessages, MailboxError>;

    /// Fetch the next unread message, or `None` when the cursor is exhausted.
    ///
    /// Messages that cannot be parsed are skipped.
    async fn next_message(
        &mut self,
        unread: &mut UnreadMessages,
    ) -> Result<Option<Message>, MailboxError>;

    /// Flag a message consumed. Idempotent; `NotFound` if it has vanished.
    async fn mark_read(&mut self, message_id: &str) -> Result<(), MailboxError>;

    /// Release the session.
    async fn disconnect(&mut self) -> Result<(), MailboxError>;
}
