//! Circuit breaker interceptor.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: origin assumed down, requests fail fast with no network call
//! - Half-Open: a bounded number of trial requests probe for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: first request after `timeout` (becomes a trial)
//! Half-Open → Closed: success_count >= success_threshold
//! Half-Open → Open: any trial fails
//! ```
//!
//! # Design Decisions
//! - Per-key circuits (default key: request origin), created lazily
//! - The clock is only read at dispatch and outcome time; no timers
//! - Failing responses still reach the caller; only the circuit observes them
//! - `on_state_change` and logging run after the record lock is released

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use tokio::time::Instant;

use crate::dispatcher::{
    AbortHandle, DispatchHandler, DispatchOptions, Dispatcher, DispatcherId, DispatcherListener, DispatcherStats,
    ResumeHandle, SubscriptionId,
};
use crate::error::{CircuitBreakerError, CircuitState, DispatchError, DispatchResult};
use crate::observability::metrics;

/// Maps a request to its circuit key.
pub type KeyFn = Arc<dyn Fn(&DispatchOptions) -> String + Send + Sync>;

/// Called as `(key, new_state, previous_state)`.
pub type StateChangeFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerOptions {
    /// Qualifying failures that open a closed circuit.
    pub threshold: u32,
    /// How long a circuit stays open before admitting a trial.
    pub timeout: Duration,
    /// Successful trials needed to close a half-open circuit.
    pub success_threshold: u32,
    /// Concurrent trials allowed while half-open.
    pub max_half_open_requests: u32,
    /// Response statuses counted as failures.
    pub status_codes: HashSet<u16>,
    pub get_key: Option<KeyFn>,
    pub on_state_change: Option<StateChangeFn>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 1,
            max_half_open_requests: 1,
            status_codes: [500, 502, 503, 504].into_iter().collect(),
            get_key: None,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerOptions {
    pub fn validate(&self) -> DispatchResult<()> {
        if self.threshold == 0 {
            return Err(DispatchError::InvalidArgument("threshold must be greater than 0".into()));
        }
        if self.success_threshold == 0 {
            return Err(DispatchError::InvalidArgument(
                "success_threshold must be greater than 0".into(),
            ));
        }
        if self.max_half_open_requests == 0 {
            return Err(DispatchError::InvalidArgument(
                "max_half_open_requests must be greater than 0".into(),
            ));
        }
        if let Some(code) = self.status_codes.iter().find(|code| !(100..=599).contains(*code)) {
            return Err(DispatchError::InvalidArgument(format!(
                "status code {code} is outside 100..=599"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("threshold", &self.threshold)
            .field("timeout", &self.timeout)
            .field("success_threshold", &self.success_threshold)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("status_codes", &self.status_codes)
            .finish_non_exhaustive()
    }
}

/// Per-key circuit state.
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition; outcomes from older generations are stale.
    generation: u64,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.failure_count = 0;
                self.success_count = 0;
                self.half_open_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.opened_at = None;
                self.half_open_in_flight = 0;
            }
        }
        Transition { from, to }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Ticket for an admitted request.
#[derive(Debug, Clone, Copy)]
struct Admission {
    trial: bool,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Neither counts; a trial only gives its slot back.
    Release,
}

struct BreakerShared {
    options: CircuitBreakerOptions,
    records: DashMap<String, CircuitRecord>,
}

impl BreakerShared {
    fn key(&self, options: &DispatchOptions) -> String {
        match &self.options.get_key {
            Some(get_key) => get_key(options),
            None => options.origin_str().to_string(),
        }
    }

    fn admit(&self, key: &str) -> Result<(Admission, Option<Transition>), CircuitState> {
        let now = Instant::now();
        let mut record = self.records.entry(key.to_string()).or_insert_with(CircuitRecord::new);

        match record.state {
            CircuitState::Closed => Ok((
                Admission {
                    trial: false,
                    generation: record.generation,
                },
                None,
            )),
            CircuitState::Open => {
                let elapsed = record.opened_at.map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                if elapsed < self.options.timeout {
                    return Err(CircuitState::Open);
                }
                let transition = record.transition(CircuitState::HalfOpen, now);
                record.half_open_in_flight = 1;
                Ok((
                    Admission {
                        trial: true,
                        generation: record.generation,
                    },
                    Some(transition),
                ))
            }
            CircuitState::HalfOpen => {
                if record.half_open_in_flight >= self.options.max_half_open_requests {
                    return Err(CircuitState::HalfOpen);
                }
                record.half_open_in_flight += 1;
                Ok((
                    Admission {
                        trial: true,
                        generation: record.generation,
                    },
                    None,
                ))
            }
        }
    }

    fn record(&self, key: &str, admission: Admission, outcome: Outcome) -> Option<Transition> {
        let now = Instant::now();
        let mut record = self.records.get_mut(key)?;
        if record.state == CircuitState::Open || record.generation != admission.generation {
            return None;
        }

        match (record.state, outcome) {
            (CircuitState::Closed, Outcome::Failure) => {
                record.failure_count += 1;
                (record.failure_count >= self.options.threshold).then(|| record.transition(CircuitState::Open, now))
            }
            (CircuitState::Closed, Outcome::Success) => {
                record.failure_count = 0;
                None
            }
            (CircuitState::HalfOpen, Outcome::Failure) => Some(record.transition(CircuitState::Open, now)),
            (CircuitState::HalfOpen, Outcome::Success) if admission.trial => {
                record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
                record.success_count += 1;
                (record.success_count >= self.options.success_threshold)
                    .then(|| record.transition(CircuitState::Closed, now))
            }
            (CircuitState::HalfOpen, Outcome::Release) if admission.trial => {
                record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
                None
            }
            _ => None,
        }
    }

    /// Runs outside the record lock.
    fn announce(&self, key: &str, transition: Transition) {
        let Transition { from, to } = transition;
        match to {
            CircuitState::Open => tracing::warn!(key = %key, from = %from, "Circuit opened"),
            CircuitState::HalfOpen => tracing::info!(key = %key, "Circuit half-open, admitting trial"),
            CircuitState::Closed => tracing::info!(key = %key, "Circuit closed"),
        }
        metrics::record_circuit_transition(key, from, to);
        if let Some(on_state_change) = &self.options.on_state_change {
            on_state_change(key, to, from);
        }
    }

    fn settle(&self, key: &str, admission: Admission, outcome: Outcome) {
        if let Some(transition) = self.record(key, admission, outcome) {
            self.announce(key, transition);
        }
    }

    fn state(&self, key: &str) -> CircuitState {
        self.records
            .get(key)
            .map_or(CircuitState::Closed, |record| record.state)
    }
}

/// Observes one admitted request and reports its outcome to the circuit.
struct BreakerHandler {
    inner: Box<dyn DispatchHandler>,
    shared: Arc<BreakerShared>,
    key: String,
    admission: Admission,
    settled: bool,
}

impl BreakerHandler {
    fn settle(&mut self, outcome: Outcome) {
        if !self.settled {
            self.settled = true;
            self.shared.settle(&self.key, self.admission, outcome);
        }
    }
}

impl DispatchHandler for BreakerHandler {
    fn on_connect(&mut self, abort: AbortHandle) {
        self.inner.on_connect(abort)
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap, resume: ResumeHandle) -> bool {
        let outcome = if self.shared.options.status_codes.contains(&status.as_u16()) {
            Outcome::Failure
        } else {
            Outcome::Success
        };
        self.settle(outcome);
        self.inner.on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.inner.on_data(chunk)
    }

    fn on_complete(&mut self, trailers: HeaderMap) {
        self.settle(Outcome::Success);
        self.inner.on_complete(trailers)
    }

    fn on_error(&mut self, err: DispatchError) {
        let outcome = if err.is_connection_error() {
            Outcome::Failure
        } else {
            Outcome::Release
        };
        self.settle(outcome);
        self.inner.on_error(err)
    }
}

impl Drop for BreakerHandler {
    fn drop(&mut self) {
        self.settle(Outcome::Release);
    }
}

/// Dispatcher wrapper failing fast for keys whose circuit is open.
pub struct CircuitBreaker<D> {
    inner: D,
    shared: Arc<BreakerShared>,
}

impl<D: Dispatcher> CircuitBreaker<D> {
    pub fn new(inner: D, options: CircuitBreakerOptions) -> DispatchResult<Self> {
        Ok(CircuitBreakerLayer::new(options)?.wrap(inner))
    }

    /// Current state of the circuit for `key` (closed when unknown).
    pub fn state(&self, key: &str) -> CircuitState {
        self.shared.state(key)
    }

    pub fn get_ref(&self) -> &D {
        &self.inner
    }
}

impl<D: Dispatcher> Dispatcher for CircuitBreaker<D> {
    fn id(&self) -> DispatcherId {
        self.inner.id()
    }

    fn dispatch(&self, options: DispatchOptions, mut handler: Box<dyn DispatchHandler>) -> bool {
        let key = self.shared.key(&options);
        match self.shared.admit(&key) {
            Ok((admission, transition)) => {
                if let Some(transition) = transition {
                    self.shared.announce(&key, transition);
                }
                let handler = Box::new(BreakerHandler {
                    inner: handler,
                    shared: Arc::clone(&self.shared),
                    key,
                    admission,
                    settled: false,
                });
                self.inner.dispatch(options, handler)
            }
            Err(state) => {
                tracing::debug!(key = %key, state = %state, "Circuit rejected request");
                metrics::record_circuit_rejection(state);
                handler.on_error(CircuitBreakerError { state, key }.into());
                true
            }
        }
    }

    fn close(&self) -> BoxFuture<'static, DispatchResult<()>> {
        self.inner.close()
    }

    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()> {
        self.inner.destroy(err)
    }

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        self.inner.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    fn stats(&self) -> DispatcherStats {
        self.inner.stats()
    }

    fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

/// `tower::Layer` producing circuit breakers that share one set of circuits.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    shared: Arc<BreakerShared>,
}

impl CircuitBreakerLayer {
    pub fn new(options: CircuitBreakerOptions) -> DispatchResult<Self> {
        options.validate()?;
        Ok(Self {
            shared: Arc::new(BreakerShared {
                options,
                records: DashMap::new(),
            }),
        })
    }

    fn wrap<D>(&self, inner: D) -> CircuitBreaker<D> {
        CircuitBreaker {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D> tower::Layer<D> for CircuitBreakerLayer {
    type Service = CircuitBreaker<D>;

    fn layer(&self, inner: D) -> Self::Service {
        self.wrap(inner)
    }
}

impl fmt::Debug for CircuitBreakerLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerLayer")
            .field("options", &self.shared.options)
            .field("circuits", &self.shared.records.len())
            .finish()
    }
}
