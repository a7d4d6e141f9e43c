//! Policy primitives: retry, circuit breaking, rate limiting, dead-lettering.

pub mod circuit_breaker;
pub mod dead_letter;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRetryPolicy, CircuitState};
pub use dead_letter::{
    DeadLetterContext, DeadLetterEntry, DeadLetterQueue, DeadLetterStatistics, DeadLetterStatus,
    InMemoryDeadLetterQueue,
};
pub use rate_limit::{
    RateLimitBehavior, RateLimitDecision, RateLimiterStatistics, TokenBucketLimiter,
    TokenBucketOptions,
};
pub use retry::{
    ExponentialBackoffPolicy, LinearRetryPolicy, NoRetryPolicy, RetryPolicy,
};
