//! REST rate limiting.
//!
//! Token bucket per variant: all REST calls acquire a token before
//! hitting the wire, waiting (not failing) when the bucket is empty.
//! Venues without native batch endpoints additionally serialize order
//! placement through a `PacedLock` that enforces the venue's order-rate
//! ceiling (e.g. Upbit 8/s means a minimum 125 ms gap between orders).

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Async token bucket.
///
/// Capacity is the burst allowance; `refill_per_sec` is the sustained
/// rate. `acquire` suspends until a token is available, so callers never
/// need to handle a "limited" branch.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            capacity: capacity as f64,
            refill_per_sec,
        }
    }

    /// Take one token, waiting for a refill when the bucket is dry.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let elapsed = st.last_refill.elapsed().as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                st.last_refill = Instant::now();

                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return;
                }
                // Time until one full token accrues
                Duration::from_secs_f64((1.0 - st.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking probe, used by tests.
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        let elapsed = st.last_refill.elapsed().as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        st.last_refill = Instant::now();
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Serializes order placement with a minimum inter-call gap.
///
/// Held across the REST call, so concurrent batch placements from many
/// accounts on the same venue cannot exceed the order-rate ceiling.
/// The clock is seeded at construction: every acquisition pays the full
/// gap, so N orders take at least N gaps of wall time.
pub struct PacedLock {
    inner: Mutex<Instant>,
    min_interval: Duration,
}

impl PacedLock {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Instant::now()),
            min_interval,
        }
    }

    /// From an orders-per-second ceiling.
    pub fn per_second(orders_per_sec: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / orders_per_sec.max(1) as f64))
    }

    /// Acquire the lock, sleeping out the remainder of the pacing gap
    /// first. Returns a guard; the next caller's gap is measured from
    /// this acquisition.
    pub async fn acquire(&self) -> PacedGuard<'_> {
        let mut slot = self.inner.lock().await;
        let since = slot.elapsed();
        if since < self.min_interval {
            tokio::time::sleep(self.min_interval - since).await;
        }
        *slot = Instant::now();
        PacedGuard { _slot: slot }
    }
}

/// Guard keeping the pacing lock held for the duration of the call.
pub struct PacedGuard<'a> {
    _slot: tokio::sync::MutexGuard<'a, Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_burst_then_dry() {
        let bucket = TokenBucket::new(3, 1000.0);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        // burst exhausted; refill at 1000/s needs ~1ms
        assert!(!bucket.try_acquire().await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1, 100.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await; // must wait ~10ms for one token
        assert!(start.elapsed() >= Duration::from_millis(8));
    }

    #[tokio::test]
    async fn test_paced_lock_enforces_gap() {
        // 8 orders/sec => 125ms gap; 4 acquisitions span >= 500ms
        let lock = PacedLock::per_second(8);
        let start = Instant::now();
        for _ in 0..4 {
            let _g = lock.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_paced_lock_serializes_concurrent_callers() {
        use std::sync::Arc;
        let lock = Arc::new(PacedLock::per_second(8));
        let start = Instant::now();
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let lock = lock.clone();
            set.spawn(async move {
                let _g = lock.acquire().await;
            });
        }
        while set.join_next().await.is_some() {}
        // 16 orders at 8/s must take at least 2 full seconds
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
