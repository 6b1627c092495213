//! Mail I/O: the inbound mailbox source and the outbound SMTP transport.

pub mod imap;
pub mod mailbox;
pub mod memory;
pub mod smtp;

pub use imap::ImapMailbox;
pub use mailbox::{MailboxSession, MailboxSource, Message, UnreadMessages};
pub use memory::MemoryMailbox;
pub use smtp::SmtpRelay;
