//! Deadline wrapping and exponential-backoff retry for idempotent reads.

use std::future::Future;
use std::time::Duration;

use crate::BrokerError;

/// Retry policy for idempotent operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Per-attempt deadline.
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, deadline: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            deadline,
        }
    }

    /// Delay before attempt `n` (1-based): `base · 2^(n-1)`, capped at 30s.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt - 1).min(16);
        (self.base_delay * factor).min(Duration::from_secs(30))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_secs(10))
    }
}

/// Run one RPC under a deadline. A timeout is reported as transient — the
/// caller decides whether its verb may be retried.
pub async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T, BrokerError>
where
    Fut: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(BrokerError::Transient {
            reason: format!("deadline {}ms exceeded", deadline.as_millis()),
        }),
    }
}

/// Retry an idempotent operation with exponential backoff.
///
/// Only [`BrokerError::Transient`] outcomes are retried; a reject aborts
/// immediately. Exhaustion converts the last transient failure into
/// [`BrokerError::Unreachable`]. NEVER use this for place/modify/cancel —
/// re-sending a non-idempotent verb after a timeout can double-execute.
pub async fn retry_idempotent<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut last = String::new();

    for attempt in 1..=policy.max_attempts {
        match with_deadline(policy.deadline, op()).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                last = e.to_string();
                tracing::warn!(op_name, attempt, error = %e, "transient broker failure");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(BrokerError::Unreachable {
        attempts: policy.max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = retry_idempotent(policy(), "fetch_orders", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerError::Transient {
                        reason: "503".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_becomes_unreachable() {
        let out: Result<(), _> = retry_idempotent(policy(), "fetch_positions", || async {
            Err(BrokerError::Transient {
                reason: "conn reset".into(),
            })
        })
        .await;
        assert!(matches!(
            out,
            Err(BrokerError::Unreachable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn reject_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), _> = retry_idempotent(policy(), "fetch_holdings", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Reject {
                    reason: "bad token".into(),
                })
            }
        })
        .await;
        assert!(matches!(out, Err(BrokerError::Reject { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_as_transient() {
        let out: Result<(), _> = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(out, Err(BrokerError::Transient { .. })));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(20), Duration::from_secs(30));
    }
}
