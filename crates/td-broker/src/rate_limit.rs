//! Per-broker token-bucket rate limiter.
//!
//! Every RPC acquires one token before hitting the wire. The bucket refills
//! continuously at `refill_per_sec`; callers park on [`TokenBucket::acquire`]
//! until a token is available, which keeps request bursts inside the
//! broker's published limits without dropping work.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity` = burst size, `refill_per_sec` = sustained rate. Both are
    /// clamped to at least 1 so a zeroed config cannot deadlock every RPC.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(refill_per_sec.max(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = match self.state.lock() {
                    Ok(g) => g,
                    // Poisoned: limiter state is advisory, do not block RPCs.
                    Err(_) => return,
                };
                let now = Instant::now();
                let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                st.last_refill = now;

                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return;
                }
                // Time until one full token accumulates.
                Duration::from_secs_f64((1.0 - st.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking acquire; used by tests and opportunistic paths.
    pub fn try_acquire(&self) -> bool {
        let mut st = match self.state.lock() {
            Ok(g) => g,
            Err(_) => return true,
        };
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        st.last_refill = now;

        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_empty() {
        let bucket = TokenBucket::new(3, 1);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(1, 10); // one token per 100ms
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_parks_until_refill() {
        let bucket = std::sync::Arc::new(TokenBucket::new(1, 10));
        assert!(bucket.try_acquire());

        let b = bucket.clone();
        let waiter = tokio::spawn(async move { b.acquire().await });

        tokio::time::advance(Duration::from_millis(200)).await;
        waiter.await.unwrap();
    }

    #[test]
    fn zero_config_is_clamped_not_deadlocked() {
        let bucket = TokenBucket::new(0, 0);
        assert!(bucket.try_acquire());
    }
}
