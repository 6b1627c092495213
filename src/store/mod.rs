//! Persistence layer: routing rules, recipients and delivery outcomes.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{
    DeliveryOutcome, OutcomeLog, OutcomeStatus, Recipient, RecipientStore, RoutingRule, RuleStore,
};
