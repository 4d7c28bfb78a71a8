use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::ReliabilityError;

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Advances every time the circuit opens. Outcomes of normal permits
    /// from an older epoch are ignored.
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    Trial,
}

/// Fails fast once a resource keeps failing.
///
/// - closed: calls pass through, consecutive failures are counted
/// - open: calls are refused with `CircuitOpen` until `reset_timeout` elapses
/// - half-open: exactly one trial call; success closes, failure reopens
///
/// Every state change is a single locked read-modify-write.
pub struct CircuitBreaker {
    resource: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

/// Releases a half-open trial slot if the call never reports an outcome
/// (for example when the caller's future is dropped).
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    epoch: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: &Result<(), &ReliabilityError>) {
        self.settled = true;
        match outcome {
            Ok(()) => self.breaker.on_success(self.kind, self.epoch),
            Err(e) if e.is_exhaustion() => self.breaker.on_abandoned(self.kind),
            Err(_) => self.breaker.on_failure(self.kind, self.epoch),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.kind);
        }
    }
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                epoch: 0,
            }),
        }
    }

    pub fn from_config(resource: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(resource, config.failure_threshold, config.reset_timeout())
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    fn try_acquire(&self) -> Result<Permit<'_>, ReliabilityError> {
        let mut inner = self.inner.lock();
        let kind = match inner.state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.reset_timeout {
                    return Err(ReliabilityError::CircuitOpen {
                        resource: self.resource.clone(),
                        retry_in: self.reset_timeout - elapsed,
                    });
                }
                info!(resource = %self.resource, "circuit half-open, allowing one trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                PermitKind::Trial
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ReliabilityError::CircuitOpen {
                        resource: self.resource.clone(),
                        retry_in: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                PermitKind::Trial
            }
        };
        Ok(Permit {
            breaker: self,
            kind,
            epoch: inner.epoch,
            settled: false,
        })
    }

    /// A normal permit issued before the circuit last opened has nothing to
    /// say about the resource now.
    fn is_stale(inner: &BreakerState, kind: PermitKind, epoch: u64) -> bool {
        kind == PermitKind::Normal && (epoch != inner.epoch || inner.state != CircuitState::Closed)
    }

    fn on_success(&self, kind: PermitKind, epoch: u64) {
        let mut inner = self.inner.lock();
        if Self::is_stale(&inner, kind, epoch) {
            debug!(resource = %self.resource, state = inner.state.as_str(), "ignoring stale success");
            return;
        }
        inner.consecutive_failures = 0;
        if kind == PermitKind::Trial {
            inner.trial_in_flight = false;
            info!(resource = %self.resource, "circuit closed after successful trial call");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    fn on_failure(&self, kind: PermitKind, epoch: u64) {
        let mut inner = self.inner.lock();
        if Self::is_stale(&inner, kind, epoch) {
            debug!(resource = %self.resource, state = inner.state.as_str(), "ignoring stale failure");
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let trip = match kind {
            PermitKind::Trial => {
                inner.trial_in_flight = false;
                true
            }
            PermitKind::Normal => inner.consecutive_failures >= self.failure_threshold,
        };
        if trip {
            warn!(
                resource = %self.resource,
                failures = inner.consecutive_failures,
                reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.epoch += 1;
        }
    }

    fn on_abandoned(&self, kind: PermitKind) {
        if kind == PermitKind::Trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    /// Runs `action` unless the circuit is open.
    ///
    /// Resource-exhaustion errors coming out of `action` (rate limit,
    /// bulkhead) are passed through without counting as failures.
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match action().await.map_err(Into::into) {
            Ok(value) => {
                permit.settle(&Ok(()));
                Ok(value)
            }
            Err(e) => {
                permit.settle(&Err(&e));
                Err(e)
            }
        }
    }

    /// Blocking counterpart of [`CircuitBreaker::execute`].
    pub fn call<T, E>(&self, action: impl FnOnce() -> Result<T, E>) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
    {
        let permit = self.try_acquire()?;
        match action().map_err(Into::into) {
            Ok(value) => {
                permit.settle(&Ok(()));
                Ok(value)
            }
            Err(e) => {
                permit.settle(&Err(&e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::CallError;

    fn fail() -> Result<(), CallError> {
        Err(CallError::Transport("connection reset".into()))
    }

    #[test]
    fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("agent", 3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker.call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                fail()
            });
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);

        let err = breaker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                fail()
            })
            .unwrap_err();
        assert_eq!(err.code(), "CIRCUIT_OPEN");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("agent", 3, Duration::from_secs(60));
        let _ = breaker.call(fail);
        let _ = breaker.call(fail);
        breaker.call(|| Ok::<_, CallError>(())).unwrap();
        assert_eq!(breaker.failure_count(), 0);
        let _ = breaker.call(fail);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::from_millis(20));
        let _ = breaker.call(fail);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        breaker.call(|| Ok::<_, CallError>(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::from_millis(20));
        let _ = breaker.call(fail);
        std::thread::sleep(Duration::from_millis(30));

        let err = breaker.call(fail).unwrap_err();
        assert_eq!(err.code(), "CALL_FAILED");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.call(fail).unwrap_err().code(), "CIRCUIT_OPEN");
    }

    #[tokio::test]
    async fn only_one_trial_call_while_half_open() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(10)));
        let _ = breaker.call(fail);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, CallError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.execute(|| async { Ok::<_, CallError>(()) }).await;
        assert_eq!(second.unwrap_err().code(), "CIRCUIT_OPEN");

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    fn held_call(
        breaker: &std::sync::Arc<CircuitBreaker>,
    ) -> (
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), ReliabilityError>>,
    ) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let breaker = std::sync::Arc::clone(breaker);
        let handle = tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    let _ = rx.await;
                    Ok::<_, CallError>(())
                })
                .await
        });
        (tx, handle)
    }

    #[tokio::test]
    async fn late_success_from_before_opening_keeps_circuit_open() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("agent", 1, Duration::from_secs(60)));
        let (release, slow) = held_call(&breaker);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _ = breaker.call(fail);
        assert_eq!(breaker.state(), CircuitState::Open);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.call(|| Ok::<_, CallError>(())).unwrap_err().code(),
            "CIRCUIT_OPEN"
        );
    }

    #[tokio::test]
    async fn late_success_during_trial_does_not_free_the_trial_slot() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));
        let (release_stale, stale) = held_call(&breaker);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = breaker.call(fail);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (release_trial, trial) = held_call(&breaker);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        release_stale.send(()).unwrap();
        stale.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let extra = breaker.call(|| Ok::<_, CallError>(()));
        assert_eq!(extra.unwrap_err().code(), "CIRCUIT_OPEN");

        release_trial.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn late_failure_from_before_opening_is_not_counted() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stale = {
            let breaker = std::sync::Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = rx.await;
                        fail()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = breaker.call(fail);
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.call(|| Ok::<_, CallError>(())).unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        tx.send(()).unwrap();
        assert!(stale.await.unwrap().is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn exhaustion_errors_do_not_trip_the_breaker() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::from_secs(60));
        let err = breaker
            .call(|| {
                Err::<(), _>(ReliabilityError::RateLimited {
                    resource: "agent".into(),
                    requested: 1,
                })
            })
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn state_names() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
