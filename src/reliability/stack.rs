use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::bulkhead::Bulkhead;
use super::circuit_breaker::CircuitBreaker;
use super::rate_limiter::RateLimiter;
use super::retry::{Classifier, RetryExecutor, default_classifier};
use crate::config::ReliabilityConfig;
use crate::error::{CallError, ReliabilityError};

/// The full wrapper stack for one resource.
///
/// Composition order is fixed: circuit breaker, retry, rate limiter,
/// bulkhead, then the call itself under the per-call timeout. An open
/// circuit therefore never consumes a token or a slot.
pub struct ResourceGuard {
    resource: String,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    limiter: RateLimiter,
    bulkhead: Bulkhead,
    call_timeout: Duration,
}

impl ResourceGuard {
    pub fn new(resource: impl Into<String>, config: &ReliabilityConfig, classifier: Classifier) -> Self {
        let resource = resource.into();
        Self {
            breaker: CircuitBreaker::from_config(resource.clone(), &config.circuit_breaker),
            retry: RetryExecutor::new(resource.clone(), config.retry.clone(), classifier),
            limiter: RateLimiter::from_config(resource.clone(), &config.rate_limiter),
            bulkhead: Bulkhead::from_config(resource.clone(), &config.bulkhead),
            call_timeout: config.call_timeout(),
            resource,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// Runs one external call through the whole stack. `action` is invoked
    /// once per attempt.
    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T, ReliabilityError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let action = &action;
        let attempt = move || self.attempt_once(action);
        self.breaker.execute(|| self.retry.execute(attempt)).await
    }

    /// Takes a token and a slot, and only then invokes `action`.
    async fn attempt_once<T, F, Fut>(&self, action: &F) -> Result<T, ReliabilityError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.limiter.try_acquire(1)?;
        let _slot = self.bulkhead.acquire().await?;
        match tokio::time::timeout(self.call_timeout, action()).await {
            Ok(result) => result.map_err(ReliabilityError::from),
            Err(_) => Err(ReliabilityError::Call(CallError::Timeout(self.call_timeout))),
        }
    }
}

/// Wrapper stacks keyed by resource name, created lazily from one config.
pub struct ReliabilityRegistry {
    config: ReliabilityConfig,
    guards: DashMap<String, Arc<ResourceGuard>>,
    classifiers: DashMap<String, Classifier>,
}

impl ReliabilityRegistry {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            guards: DashMap::new(),
            classifiers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Registers a failure classifier for `resource`. Only affects stacks
    /// created afterwards.
    pub fn with_classifier(self, resource: impl Into<String>, classifier: Classifier) -> Self {
        self.classifiers.insert(resource.into(), classifier);
        self
    }

    pub fn guard(&self, resource: &str) -> Arc<ResourceGuard> {
        if let Some(existing) = self.guards.get(resource) {
            return Arc::clone(existing.value());
        }
        let entry = self.guards.entry(resource.to_string()).or_insert_with(|| {
            let classifier = self
                .classifiers
                .get(resource)
                .map(|c| Arc::clone(c.value()))
                .unwrap_or_else(default_classifier);
            Arc::new(ResourceGuard::new(resource, &self.config, classifier))
        });
        Arc::clone(entry.value())
    }

    pub async fn execute<T, F, Fut>(&self, resource: &str, action: F) -> Result<T, ReliabilityError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let guard = self.guard(resource);
        guard.execute(action).await
    }

    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.guards.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
