//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! caller
//!     → retries.rs (re-dispatch failed attempts, resume interrupted bodies)
//!     → circuit_breaker.rs (fail fast while an origin's circuit is open)
//!     → pool
//! ```
//!
//! # Design Decisions
//! - Both interceptors are `Dispatcher` wrappers composable with `tower::Layer`
//! - Neither swallows errors: they forward, observe, or short-circuit
//! - backoff.rs is shared by the default retry policy

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerLayer, CircuitBreakerOptions};
pub use retries::{
    DefaultRetryPolicy, Retry, RetryCallback, RetryContext, RetryLayer, RetryOptions, RetryPolicy, RetryState,
};
