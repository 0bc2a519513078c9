//! Startup orchestration.
//!
//! # Responsibilities
//! - Install logging from configuration
//! - Build the dispatcher stack in dependency order
//!
//! # Design Decisions
//! - Fail fast: an invalid option is a startup error, never a runtime one
//! - Pool first, then circuit breaker, then retry (outermost)
//! - Each interceptor is optional and configured independently

use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::dispatcher::{Dispatcher, DispatcherExt};
use crate::error::DispatchResult;
use crate::load_balancer::BalancedPool;
use crate::observability::logging;
use crate::resilience::{CircuitBreakerLayer, RetryLayer};

/// A configured stack and a handle on its pool.
pub struct DispatchStack {
    /// Outermost dispatcher; hand requests here.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// The balanced pool at the bottom, for upstream management.
    pub pool: Arc<BalancedPool>,
}

/// Compose Retry → CircuitBreaker → BalancedPool from configuration.
pub fn build_stack(config: &DispatchConfig) -> DispatchResult<DispatchStack> {
    let pool = BalancedPool::new(
        config.upstreams.iter().map(String::as_str),
        config.balancer.to_options(&config.pool),
    )?;

    let mut dispatcher: Arc<dyn Dispatcher> = pool.clone();
    if config.circuit_breaker.enabled {
        let layer = CircuitBreakerLayer::new(config.circuit_breaker.to_options())?;
        dispatcher = dispatcher.layer(layer).boxed();
    }
    if config.retry.enabled {
        let layer = RetryLayer::new(config.retry.to_options())?;
        dispatcher = dispatcher.layer(layer).boxed();
    }

    tracing::info!(
        upstreams = config.upstreams.len(),
        connections = config.pool.connections,
        circuit_breaker = config.circuit_breaker.enabled,
        retry = config.retry.enabled,
        "Dispatch stack ready"
    );

    Ok(DispatchStack { dispatcher, pool })
}

/// Install logging, then build the stack.
pub fn start(config: &DispatchConfig) -> DispatchResult<DispatchStack> {
    if !logging::init(&config.observability.log_level) {
        tracing::debug!("Global subscriber already installed");
    }
    build_stack(config)
}
