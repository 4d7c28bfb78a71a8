//! Fault-tolerance wrappers for outbound calls.
//!
//! Each wrapper can be used on its own; [`ResourceGuard`] composes all four
//! in the fixed order circuit breaker → retry → rate limiter → bulkhead, and
//! [`ReliabilityRegistry`] keeps one guard per resource name.

mod bulkhead;
mod circuit_breaker;
mod rate_limiter;
mod retry;
mod stack;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::{Classifier, ErrorClass, RetryExecutor, default_classifier};
pub use stack::{ReliabilityRegistry, ResourceGuard};
