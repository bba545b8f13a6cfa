//! Resilience patterns applied to every registry call.
//!
//! - **Retry**: bounded exponential backoff for transient failures
//! - **Timeout**: per-operation deadlines that cancel in-flight I/O on expiry

pub mod retry;
pub mod timeout;

pub use retry::{retry, retry_if, ExponentialBackoff, JitterStrategy, RetryConfig, RetryError, RetryPolicy};
pub use timeout::{with_timeout, TimeoutConfig};
