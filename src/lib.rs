//! Client-side dispatch resilience layer.
//!
//! Requests flow through optional interceptors into a pool that spreads them
//! over member dispatchers, queueing when every member is saturated:
//!
//! ```text
//! caller → Retry → CircuitBreaker → BalancedPool / RoundRobinPool → HttpClient → origin
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;

pub use config::DispatchConfig;
pub use dispatcher::{
    AbortHandle, AbortSignal, DispatchHandler, DispatchOptions, DispatchRequest, Dispatcher, DispatcherEvent,
    DispatcherExt, DispatcherId, DispatcherStats, DrainWaiter, ResumeHandle,
};
pub use error::{CircuitBreakerError, CircuitState, DispatchError, DispatchResult, RequestRetryError};
pub use http::{ClientOptions, HttpClient};
pub use lifecycle::{build_stack, shutdown, DispatchStack};
pub use load_balancer::{BalancedPool, BalancedPoolOptions, PoolOptions, RoundRobinPool};
pub use resilience::{CircuitBreaker, CircuitBreakerLayer, CircuitBreakerOptions, Retry, RetryLayer, RetryOptions};
