//! Configuration schema definitions.
//!
//! Every section is defaulted so an empty file yields the library defaults.
//! Durations are spelled in milliseconds.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::ClientOptions;
use crate::load_balancer::{BalancedPoolOptions, PoolOptions};
use crate::resilience::{CircuitBreakerOptions, RetryOptions};

/// Root configuration of a dispatch stack.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upstream origins, e.g. `http://10.0.0.1:8080`.
    pub upstreams: Vec<String>,

    /// Per-upstream connection pool.
    pub pool: PoolConfig,

    pub balancer: BalancerConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub retry: RetryConfig,

    pub observability: ObservabilityConfig,
}

/// Connections per upstream and their timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connections: usize,

    /// Requests in flight per connection.
    pub pipelining: usize,

    pub connect_timeout_ms: u64,

    pub headers_timeout_ms: u64,

    pub body_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections: 10,
            pipelining: 1,
            connect_timeout_ms: 10_000,
            headers_timeout_ms: 300_000,
            body_timeout_ms: 300_000,
        }
    }
}

impl PoolConfig {
    pub fn to_options(&self) -> PoolOptions {
        PoolOptions {
            connections: self.connections,
            client: ClientOptions {
                pipelining: self.pipelining,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                headers_timeout: Duration::from_millis(self.headers_timeout_ms),
                body_timeout: Duration::from_millis(self.body_timeout_ms),
            },
            factory: None,
        }
    }
}

/// Adaptive weighting across upstreams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub max_weight_per_server: u32,

    /// Weight lost per connection error.
    pub error_penalty: u32,

    /// Weight regained per full selection pass.
    pub recovery_step: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_weight_per_server: 100,
            error_penalty: 15,
            recovery_step: 1,
        }
    }
}

impl BalancerConfig {
    pub fn to_options(&self, pool: &PoolConfig) -> BalancedPoolOptions {
        BalancedPoolOptions {
            max_weight_per_server: self.max_weight_per_server,
            error_penalty: self.error_penalty,
            recovery_step: self.recovery_step,
            pool: pool.to_options(),
            factory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Failures that open a circuit.
    pub threshold: u32,

    /// Time a circuit stays open before a trial request.
    pub timeout_ms: u64,

    /// Successful trials that close a half-open circuit.
    pub success_threshold: u32,

    pub max_half_open_requests: u32,

    /// Statuses counted as failures.
    pub status_codes: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            timeout_ms: 30_000,
            success_threshold: 1,
            max_half_open_requests: 1,
            status_codes: vec![500, 502, 503, 504],
        }
    }
}

impl CircuitBreakerConfig {
    pub fn to_options(&self) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            threshold: self.threshold,
            timeout: Duration::from_millis(self.timeout_ms),
            success_threshold: self.success_threshold,
            max_half_open_requests: self.max_half_open_requests,
            status_codes: self.status_codes.iter().copied().collect(),
            ..CircuitBreakerOptions::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    pub max_retries: u32,

    /// Delay before the first retry.
    pub min_timeout_ms: u64,

    /// Cap on any retry delay.
    pub max_timeout_ms: u64,

    pub timeout_factor: u32,

    /// Honour `Retry-After` headers.
    pub retry_after: bool,

    /// Methods eligible for retry.
    pub methods: Vec<String>,

    pub status_codes: Vec<u16>,

    /// Error codes eligible for retry (`ECONNREFUSED`, `UND_ERR_SOCKET`, ...).
    pub error_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryOptions::default();
        let mut methods: Vec<String> = defaults.methods.iter().map(|m| m.to_string()).collect();
        methods.sort();
        let mut status_codes: Vec<u16> = defaults.status_codes.iter().copied().collect();
        status_codes.sort_unstable();
        let mut error_codes: Vec<String> = defaults.error_codes.iter().cloned().collect();
        error_codes.sort();

        Self {
            enabled: true,
            max_retries: defaults.max_retries,
            min_timeout_ms: defaults.min_timeout.as_millis() as u64,
            max_timeout_ms: defaults.max_timeout.as_millis() as u64,
            timeout_factor: defaults.timeout_factor,
            retry_after: defaults.retry_after,
            methods,
            status_codes,
            error_codes,
        }
    }
}

impl RetryConfig {
    /// Unparseable method names are skipped; `validate_config` reports them.
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_retries: self.max_retries,
            min_timeout: Duration::from_millis(self.min_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            timeout_factor: self.timeout_factor,
            retry_after: self.retry_after,
            methods: self
                .methods
                .iter()
                .filter_map(|method| method.to_ascii_uppercase().parse().ok())
                .collect(),
            status_codes: self.status_codes.iter().copied().collect(),
            error_codes: self.error_codes.iter().cloned().collect::<HashSet<_>>(),
            ..RetryOptions::default()
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
