//! Bounded-retry delivery of composed forwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// Fixed-delay retry: `max_attempts` tries, `delay` between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Waits between delivery attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outbound submission of one composed message to its single recipient.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn submit(&self, message: &lettre::Message) -> Result<(), DeliveryError>;
}

/// Submits through a transport, retrying per the policy.
pub struct Deliverer {
    transport: Arc<dyn DeliveryTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl Deliverer {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            policy,
        }
    }

    /// Deliver, stopping at the first successful attempt.
    ///
    /// Fails with `DeliveryError::Exhausted` wrapping the last error once every
    /// attempt has failed.
    pub async fn deliver(
        &self,
        destination: &str,
        message: &lettre::Message,
    ) -> Result<u32, DeliveryError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.sleeper.sleep(self.policy.delay).await;
            }
            match self.transport.submit(message).await {
                Ok(()) => {
                    debug!(destination, attempt, "Forward submitted");
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(destination, attempt, max_attempts, error = %e, "Delivery attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(DeliveryError::Exhausted {
            attempts: max_attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| DeliveryError::Transport("no attempt made".into())),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyTransport {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DeliveryTransport for FlakyTransport {
        async fn submit(&self, _message: &lettre::Message) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                Err(DeliveryError::Transport(format!("connection reset #{call}")))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn message() -> lettre::Message {
        lettre::Message::builder()
            .from("relay@example.com".parse().unwrap())
            .to("ap@example.com".parse().unwrap())
            .subject("[Fwd] invoices")
            .body("body".to_string())
            .unwrap()
    }

    fn deliverer(failures: u32) -> (Deliverer, Arc<FlakyTransport>, Arc<RecordingSleeper>) {
        let transport = Arc::new(FlakyTransport {
            failures_before_success: failures,
            calls: AtomicU32::new(0),
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let d = Deliverer::new(transport.clone(), sleeper.clone(), RetryPolicy::default());
        (d, transport, sleeper)
    }

    #[tokio::test]
    async fn first_attempt_success_does_not_sleep() {
        let (d, transport, sleeper) = deliverer(0);
        assert_eq!(d.deliver("ap@example.com", &message()).await.unwrap(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let (d, transport, sleeper) = deliverer(2);
        assert_eq!(d.deliver("ap@example.com", &message()).await.unwrap(), 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn exhausted_wraps_last_error() {
        let (d, transport, sleeper) = deliverer(10);
        let err = d.deliver("ap@example.com", &message()).await.unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.sleeps.lock().unwrap().len(), 2);
        match err {
            DeliveryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("connection reset #3"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempt_policy_still_tries_once() {
        let transport = Arc::new(FlakyTransport {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            max_attempts: 0,
            delay: Duration::from_secs(2),
        };
        let d = Deliverer::new(transport.clone(), Arc::new(TokioSleeper), policy);
        d.deliver("ap@example.com", &message()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
