//! Forwarding pipeline.
//!
//! Every unread message flows through:
//! 1. `router::parse_subject()`: `keyword - destination` grammar
//! 2. `RuleSnapshot::allows()`: active keyword check
//! 3. `RecipientDirectory::resolve_or_create()`: destination → recipient
//! 4. `compose()` + `Deliverer::deliver()`: bounded-retry SMTP submission
//! 5. outcome record, then mark consumed
//!
//! `Forwarder::run_now()` is shared by the scheduler and the HTTP trigger.

pub mod compose;
pub mod delivery;
pub mod forwarder;
pub mod recipients;
pub mod router;
pub mod scheduler;

pub use delivery::{DeliveryTransport, RetryPolicy, Sleeper, TokioSleeper};
pub use forwarder::{Forwarder, ForwarderDeps, ForwarderSettings, RunSummary};
pub use scheduler::{Cadence, RunScheduler, SchedulerHandle};
