//! Periodic run scheduler.
//!
//! Fires one run immediately at startup, then one per cadence period. Ticks
//! that come due while a run is in progress are not dropped: they fire
//! back-to-back once it finishes, each waiting on the forwarder's run lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::forwarder::Forwarder;

/// Run cadence at second, minute or hour granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Seconds(u64),
    Minutes(u64),
    Hours(u64),
}

impl Cadence {
    /// Normalize an interval: under a minute keeps whole seconds (at least 1),
    /// under an hour truncates to whole minutes, longer truncates to whole hours.
    pub fn from_duration(interval: Duration) -> Self {
        let secs = interval.as_secs();
        if secs < 60 {
            Cadence::Seconds(secs.max(1))
        } else if secs < 3600 {
            Cadence::Minutes(secs / 60)
        } else {
            Cadence::Hours(secs / 3600)
        }
    }

    /// Period between runs. Never zero.
    pub fn period(&self) -> Duration {
        let secs = match *self {
            Cadence::Seconds(n) => n,
            Cadence::Minutes(n) => n.saturating_mul(60),
            Cadence::Hours(n) => n.saturating_mul(3600),
        };
        Duration::from_secs(secs.max(1))
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Seconds(n) => write!(f, "every {n}s"),
            Cadence::Minutes(n) => write!(f, "every {n}m"),
            Cadence::Hours(n) => write!(f, "every {n}h"),
        }
    }
}

pub struct RunScheduler {
    forwarder: Arc<Forwarder>,
    cadence: Cadence,
}

impl RunScheduler {
    pub fn new(forwarder: Arc<Forwarder>, cadence: Cadence) -> Self {
        Self { forwarder, cadence }
    }

    /// Spawn the scheduler loop.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let Self { forwarder, cadence } = self;
        let idle = Arc::clone(&forwarder);

        let handle = tokio::spawn(async move {
            info!(%cadence, "Run scheduler started");
            let mut ticker = tokio::time::interval(cadence.period());

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = forwarder.run_now().await {
                    error!(error = %e, "Forwarding run failed");
                }
            }
            info!("Run scheduler stopped");
        });

        SchedulerHandle {
            handle,
            shutdown: shutdown_tx,
            forwarder: idle,
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    forwarder: Arc<Forwarder>,
}

impl SchedulerHandle {
    /// Stop scheduling and wait up to `grace` for in-flight runs to finish,
    /// including runs started by other triggers on the same forwarder.
    ///
    /// Returns `false` if the grace period expired and the run was abandoned.
    pub async fn stop(self, grace: Duration) -> bool {
        let Self {
            mut handle,
            shutdown,
            forwarder,
        } = self;
        let _ = shutdown.send(true);

        let drained = async {
            let _ = (&mut handle).await;
            forwarder.wait_idle().await;
        };
        let result = tokio::time::timeout(grace, drained).await;
        match result {
            Ok(()) => true,
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "In-flight run exceeded shutdown grace period");
                handle.abort();
                false
            }
        }
    }
}
