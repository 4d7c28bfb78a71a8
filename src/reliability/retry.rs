use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{CallError, ReliabilityError};

/// How a failed call should be treated by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Injectable failure classification, configured per resource.
pub type Classifier = Arc<dyn Fn(&CallError) -> ErrorClass + Send + Sync>;

/// Transport problems, throttling, timeouts and 5xx/429 rejections are
/// retryable; everything else is fatal.
pub fn default_classifier() -> Classifier {
    Arc::new(|err: &CallError| match err {
        CallError::Transport(_) | CallError::Throttled { .. } | CallError::Timeout(_) => {
            ErrorClass::Retryable
        }
        CallError::Rejected { status, .. } if *status == 429 || *status >= 500 => {
            ErrorClass::Retryable
        }
        CallError::Rejected { .. } | CallError::Malformed(_) => ErrorClass::Fatal,
    })
}

/// Retries classified-retryable failures with exponential backoff.
pub struct RetryExecutor {
    resource: String,
    config: RetryConfig,
    classifier: Classifier,
    total_retries: AtomicU64,
}

impl RetryExecutor {
    pub fn new(resource: impl Into<String>, config: RetryConfig, classifier: Classifier) -> Self {
        Self {
            resource: resource.into(),
            config,
            classifier,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(resource: impl Into<String>) -> Self {
        Self::new(resource, RetryConfig::default(), default_classifier())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn classify(&self, err: &CallError) -> ErrorClass {
        (self.classifier)(err)
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// A throttling hint from the upstream wins over the computed backoff.
    pub fn backoff(&self, attempt: u32, err: &CallError) -> Duration {
        if let CallError::Throttled { retry_after_ms } = err {
            return Duration::from_millis(*retry_after_ms).min(Duration::from_millis(self.config.max_delay_ms));
        }

        let base = self.config.delay_for_attempt(attempt);
        let jitter = self.config.jitter_factor;
        if jitter <= 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let range = base_ms * jitter;
        let offset = rand::rng().random_range(-range..=range);
        Duration::from_millis((base_ms + offset).max(0.0) as u64)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Decides whether `err` on `attempt` warrants another try.
    fn should_retry(&self, attempt: u32, err: &CallError) -> bool {
        if self.classify(err) == ErrorClass::Fatal {
            debug!(resource = %self.resource, error = %err, "fatal error, not retrying");
            return false;
        }
        if attempt + 1 >= self.max_attempts() {
            warn!(
                resource = %self.resource,
                attempts = attempt + 1,
                error = %err,
                "retry budget exhausted"
            );
            return false;
        }
        true
    }

    fn log_retry(&self, attempt: u32, delay: Duration, err: &CallError) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            resource = %self.resource,
            attempt = attempt + 1,
            max_attempts = self.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after error"
        );
    }

    /// Runs `action` until it succeeds, fails fatally, or attempts run out.
    /// Returns the last error in the latter two cases.
    ///
    /// Resource-exhaustion errors are returned immediately.
    pub async fn execute<T, E, F, Fut>(&self, mut action: F) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let err = match action().await.map_err(Into::into) {
                Ok(value) => return Ok(value),
                Err(ReliabilityError::Call(err)) => err,
                Err(other) => return Err(other),
            };
            if !self.should_retry(attempt, &err) {
                return Err(ReliabilityError::Call(err));
            }
            let delay = self.backoff(attempt, &err);
            self.log_retry(attempt, delay, &err);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Blocking counterpart of [`RetryExecutor::execute`]; sleeps the thread.
    pub fn execute_blocking<T, E>(
        &self,
        mut action: impl FnMut() -> Result<T, E>,
    ) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
    {
        let mut attempt = 0;
        loop {
            let err = match action().map_err(Into::into) {
                Ok(value) => return Ok(value),
                Err(ReliabilityError::Call(err)) => err,
                Err(other) => return Err(other),
            };
            if !self.should_retry(attempt, &err) {
                return Err(ReliabilityError::Call(err));
            }
            let delay = self.backoff(attempt, &err);
            self.log_retry(attempt, delay, &err);
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}
