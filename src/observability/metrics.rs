//! Metrics collection.
//!
//! # Responsibilities
//! - Define dispatch metrics (outcomes, queue depth, weights, breaker and retry activity)
//! - Record through the `metrics` facade; installing an exporter is the application's job
//!
//! # Metrics
//! - `dispatch_requests_total` (counter): dispatches by pool and outcome
//! - `dispatch_queue_depth` (gauge): requests waiting in a pool queue
//! - `dispatch_upstream_weight` (gauge): current BalancedPool weight per origin
//! - `circuit_breaker_transitions_total` (counter): state changes by key
//! - `circuit_breaker_rejections_total` (counter): fail-fast rejections by state
//! - `dispatch_retries_total` (counter): scheduled retries by error code
//!
//! # Design Decisions
//! - Without a recorder installed every call is a no-op
//! - Label values are owned strings so callers may pass borrowed data

use crate::error::CircuitState;

/// Outcome label for `dispatch_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A member started the request.
    Accepted,
    /// Every member was busy; the request waits in the queue.
    Queued,
    /// The request was settled with an error.
    Rejected,
}

impl DispatchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Accepted => "accepted",
            DispatchOutcome::Queued => "queued",
            DispatchOutcome::Rejected => "rejected",
        }
    }
}

pub fn record_dispatch(pool: &str, outcome: DispatchOutcome) {
    metrics::counter!(
        "dispatch_requests_total",
        "pool" => pool.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_queue_depth(pool: &str, depth: usize) {
    metrics::gauge!("dispatch_queue_depth", "pool" => pool.to_string()).set(depth as f64);
}

pub fn record_upstream_weight(origin: &str, weight: u32) {
    metrics::gauge!("dispatch_upstream_weight", "origin" => origin.to_string()).set(f64::from(weight));
}

pub fn record_circuit_transition(key: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "key" => key.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_circuit_rejection(state: CircuitState) {
    metrics::counter!("circuit_breaker_rejections_total", "state" => state.as_str()).increment(1);
}

pub fn record_retry(code: &str) {
    metrics::counter!("dispatch_retries_total", "code" => code.to_string()).increment(1);
}
