//! Mail Relay: keyword-routed mailbox forwarding.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
