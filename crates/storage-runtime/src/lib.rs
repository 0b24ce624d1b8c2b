//! Storage runtime: circuit breaker and retry with exponential backoff
//! around every durable round trip made by the decision stores.

pub mod runtime;

pub use runtime::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy, StorageMetrics,
    StorageRuntime,
};
