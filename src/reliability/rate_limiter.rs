use std::future::Future;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::RateLimiterConfig;
use crate::error::ReliabilityError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket. Refill and debit happen under one lock, so two callers can
/// never both observe enough tokens before either has debited.
pub struct RateLimiter {
    resource: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Starts with a full bucket.
    pub fn new(resource: impl Into<String>, capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            resource: resource.into(),
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(resource: impl Into<String>, config: &RateLimiterConfig) -> Self {
        Self::new(resource, config.capacity, config.refill_per_sec)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Debits `n` tokens or fails with `RateLimited`. Never blocks beyond the
    /// bucket lock.
    pub fn try_acquire(&self, n: u32) -> Result<(), ReliabilityError> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        let wanted = f64::from(n);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            Ok(())
        } else {
            debug!(
                resource = %self.resource,
                requested = n,
                available = bucket.tokens,
                "rate limited"
            );
            Err(ReliabilityError::RateLimited {
                resource: self.resource.clone(),
                requested: n,
            })
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Takes one token, then runs `action`.
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire(1)?;
        action().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::CallError;

    #[test]
    fn debits_until_empty() {
        let limiter = RateLimiter::new("agent", 3, 0.0);
        assert!(limiter.try_acquire(2).is_ok());
        assert!(limiter.try_acquire(1).is_ok());
        let err = limiter.try_acquire(1).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
    }

    #[test]
    fn request_larger_than_capacity_is_refused() {
        let limiter = RateLimiter::new("agent", 2, 100.0);
        assert!(limiter.try_acquire(3).is_err());
        assert!(limiter.try_acquire(2).is_ok());
    }

    #[test]
    fn refills_over_time_up_to_capacity() {
        let limiter = RateLimiter::new("agent", 2, 100.0);
        limiter.try_acquire(2).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire(1).is_ok());
        thread::sleep(Duration::from_millis(100));
        assert!(limiter.available() <= 2.0);
    }

    #[test]
    fn concurrent_acquires_never_over_debit() {
        let limiter = Arc::new(RateLimiter::new("agent", 50, 0.0));
        let granted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    for _ in 0..20 {
                        if limiter.try_acquire(1).is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 50);
        assert!(limiter.available() < 1.0);
    }

    #[test]
    fn concurrent_acquires_respect_refill_bound() {
        let refill = 200.0;
        let limiter = Arc::new(RateLimiter::new("agent", 10, refill));
        let granted = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if limiter.try_acquire(1).is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let bound = 10.0 + started.elapsed().as_secs_f64() * refill;
        assert!(f64::from(granted.load(Ordering::SeqCst)) <= bound.floor() + 1.0);
    }

    #[tokio::test]
    async fn execute_skips_action_when_limited() {
        let limiter = RateLimiter::new("agent", 1, 0.0);
        limiter
            .execute(|| async { Ok::<_, CallError>(()) })
            .await
            .unwrap();

        let ran = AtomicU32::new(0);
        let err = limiter
            .execute(|| {
                ran.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CallError>(()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_exhaustion());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
