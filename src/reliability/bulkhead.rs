use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::BulkheadConfig;
use crate::error::ReliabilityError;

/// Bounds the number of in-flight calls to one resource.
pub struct Bulkhead {
    resource: String,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

/// Slot held for the duration of one call. Dropping it frees the slot,
/// whatever the outcome of the call.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub fn new(resource: impl Into<String>, capacity: usize, acquire_timeout: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            resource: resource.into(),
            capacity,
            acquire_timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn from_config(resource: impl Into<String>, config: &BulkheadConfig) -> Self {
        Self::new(resource, config.capacity, Some(config.acquire_timeout()))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Callers currently queued for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Waits for a free slot, up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<BulkheadPermit, ReliabilityError> {
        let started = Instant::now();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _queued = WaitingGuard(&self.waiting);

        let acquired = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, Arc::clone(&self.semaphore).acquire_owned())
                .await
                .ok(),
            None => Some(Arc::clone(&self.semaphore).acquire_owned().await),
        };

        match acquired {
            Some(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
            // Timed out, or the semaphore was closed.
            _ => {
                let waited = started.elapsed();
                debug!(
                    resource = %self.resource,
                    waited_ms = waited.as_millis() as u64,
                    "bulkhead acquire timed out"
                );
                Err(ReliabilityError::BulkheadTimeout {
                    resource: self.resource.clone(),
                    waited,
                })
            }
        }
    }

    /// Runs `action` while holding a slot.
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, ReliabilityError>
    where
        E: Into<ReliabilityError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.acquire().await?;
        action().await.map_err(Into::into)
    }
}
