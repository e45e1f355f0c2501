//! Network utilities shared by the remote store and the serving status client.
//!
//! This module provides:
//! - A configured HTTP client
//! - Retry logic with exponential backoff and jitter
//! - Circuit breakers for namenode failover

mod circuit_breaker;
mod client;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::HttpClient;
pub use retry::{retry_async, RetryConfig};
