//! Guards protecting the upstream call path: admission control, failure
//! isolation, and bounded retry.

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterStatus};
pub use retry::RetryPolicy;
