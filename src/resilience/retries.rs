//! Retry interceptor.
//!
//! # Responsibilities
//! - Re-issue failed attempts of one logical request, as decided by a policy
//! - Keep retryable status responses away from the caller until retries run out
//! - Resume interrupted 2xx bodies with `Range` + `If-Match`
//!
//! # Data Flow
//! ```text
//! caller handler
//!     ← RetryAttempt (one per attempt, owns the caller handler while in flight)
//!     ← inner dispatcher
//! on failure: RetryPolicy::retry(err, ctx, done)
//!     → done(None): next RetryAttempt with Range headers when resuming
//!     → done(Some(err)): caller.on_error(err)
//! ```
//!
//! # Design Decisions
//! - The caller handler moves from attempt to policy callback and back, so
//!   exactly one attempt can ever report to it
//! - The caller sees one abort handle and one resume handle for the whole
//!   logical request; they forward to whichever attempt is current
//! - An abort cancels a pending backoff timer through a `watch` channel
//! - ETag or Content-Range mismatches are terminal

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_MATCH, RANGE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::watch;

use crate::dispatcher::{
    AbortHandle, AbortListenerId, AbortSignal, DispatchHandler, DispatchOptions, Dispatcher, DispatcherId,
    DispatcherListener, DispatcherStats, ResumeHandle, SubscriptionId,
};
use crate::error::{DispatchError, DispatchResult, RequestRetryError};
use crate::observability::metrics;
use crate::resilience::backoff::{calculate_backoff, parse_retry_after};

const ERR_POISONED_LINK: &str = "retry link mutex poisoned";

/// Decides whether a failed attempt is tried again.
///
/// Implementations must eventually consume `done`: `done.done(None)`
/// re-dispatches, `done.done(Some(err))` fails the logical request.
pub trait RetryPolicy: Send + Sync {
    fn retry(&self, err: &DispatchError, ctx: RetryContext<'_>, done: RetryCallback);
}

impl<F> RetryPolicy for F
where
    F: Fn(&DispatchError, RetryContext<'_>, RetryCallback) + Send + Sync,
{
    fn retry(&self, err: &DispatchError, ctx: RetryContext<'_>, done: RetryCallback) {
        self(err, ctx, done)
    }
}

#[derive(Clone)]
pub struct RetryOptions {
    pub policy: Arc<dyn RetryPolicy>,
    pub max_retries: u32,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound for backoff delays. A `Retry-After` longer than this
    /// fails the request with the last error instead of retrying early.
    pub max_timeout: Duration,
    pub timeout_factor: u32,
    /// Honour `Retry-After` response headers.
    pub retry_after: bool,
    pub methods: HashSet<Method>,
    /// Response statuses that trigger a retry.
    pub status_codes: HashSet<u16>,
    /// `DispatchError::code()` values that trigger a retry.
    pub error_codes: HashSet<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            policy: Arc::new(DefaultRetryPolicy),
            max_retries: 5,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(30),
            timeout_factor: 2,
            retry_after: true,
            methods: [
                Method::GET,
                Method::HEAD,
                Method::OPTIONS,
                Method::PUT,
                Method::DELETE,
                Method::TRACE,
            ]
            .into_iter()
            .collect(),
            status_codes: [500, 502, 503, 504, 429].into_iter().collect(),
            error_codes: [
                "ECONNRESET",
                "ECONNREFUSED",
                "ENOTFOUND",
                "ENETDOWN",
                "ENETUNREACH",
                "EHOSTDOWN",
                "EHOSTUNREACH",
                "EPIPE",
                "UND_ERR_SOCKET",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl RetryOptions {
    /// Replace the policy with a closure.
    pub fn with_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&DispatchError, RetryContext<'_>, RetryCallback) + Send + Sync + 'static,
    {
        self.policy = Arc::new(policy);
        self
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.timeout_factor == 0 {
            return Err(DispatchError::InvalidArgument("timeout_factor must be at least 1".into()));
        }
        if self.min_timeout > self.max_timeout {
            return Err(DispatchError::InvalidArgument(
                "min_timeout must not exceed max_timeout".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("timeout_factor", &self.timeout_factor)
            .field("retry_after", &self.retry_after)
            .field("methods", &self.methods)
            .field("status_codes", &self.status_codes)
            .field("error_codes", &self.error_codes)
            .finish_non_exhaustive()
    }
}

/// Progress of one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far.
    pub attempt: u32,
    /// Absolute offset of the next body byte the caller expects.
    pub bytes_received: u64,
    /// Last body offset, from `Content-Range` or `Content-Length`.
    pub end: Option<u64>,
    /// Strong ETag of the response being resumed.
    pub etag: Option<String>,
}

/// What a policy sees about the failed attempt.
pub struct RetryContext<'a> {
    pub state: &'a RetryState,
    pub options: &'a RetryOptions,
    pub method: &'a Method,
    cancel: watch::Receiver<bool>,
}

impl RetryContext<'_> {
    /// Re-dispatch after `delay`, unless the request is aborted first.
    pub fn schedule(&self, delay: Duration, done: RetryCallback) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            done.done(Some(DispatchError::Other(
                "retry scheduled outside a tokio runtime".into(),
            )));
            return;
        };

        let cancel = self.cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel) => {}
            }
            // the callback settles with the abort reason when aborted
            done.done(None);
        });
    }
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        let aborted = *cancel.borrow_and_update();
        if aborted {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Continuation handed to a policy. Dropping it unused fails the request.
pub struct RetryCallback {
    continuation: Option<Continuation>,
}

impl RetryCallback {
    pub fn done(mut self, err: Option<DispatchError>) {
        if let Some(continuation) = self.continuation.take() {
            continuation.finish(err);
        }
    }
}

impl Drop for RetryCallback {
    fn drop(&mut self) {
        if let Some(continuation) = self.continuation.take() {
            continuation.finish(Some(DispatchError::Other(
                "retry policy dropped its callback".into(),
            )));
        }
    }
}

impl fmt::Debug for RetryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCallback")
            .field("pending", &self.continuation.is_some())
            .finish()
    }
}

/// Network errors and retryable statuses, with exponential backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn retry(&self, err: &DispatchError, ctx: RetryContext<'_>, done: RetryCallback) {
        match retry_delay(err, ctx.state, ctx.options, ctx.method, SystemTime::now()) {
            Some(delay) => {
                tracing::warn!(
                    attempt = ctx.state.attempt,
                    code = err.code(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                );
                metrics::record_retry(err.code());
                ctx.schedule(delay, done);
            }
            None => done.done(Some(err.clone())),
        }
    }
}

/// Delay before the next attempt, or `None` to give up.
pub fn retry_delay(
    err: &DispatchError,
    state: &RetryState,
    options: &RetryOptions,
    method: &Method,
    now: SystemTime,
) -> Option<Duration> {
    if state.attempt > options.max_retries || err.is_configuration_error() {
        return None;
    }
    if !options.methods.contains(method) {
        return None;
    }
    let retryable = match err.status() {
        Some(status) => options.status_codes.contains(&status.as_u16()),
        None => options.error_codes.contains(err.code()),
    };
    if !retryable {
        return None;
    }

    let retry_after = if options.retry_after {
        err.headers()
            .and_then(|headers| headers.get(RETRY_AFTER))
            .and_then(|value| parse_retry_after(value, now))
    } else {
        None
    };

    match retry_after {
        // server wants longer than we are willing to wait
        Some(delay) if delay > options.max_timeout => None,
        Some(delay) if !delay.is_zero() => Some(delay),
        _ => Some(calculate_backoff(
            state.attempt,
            options.min_timeout,
            options.max_timeout,
            options.timeout_factor,
        )),
    }
}

/// Parsed `Content-Range: bytes <start>-<end>/<size>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    end: u64,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (span, size) = range.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start = start.parse().ok()?;
    let end = end.parse().ok()?;
    if size != "*" {
        size.parse::<u64>().ok()?;
    }
    (start <= end).then_some(ContentRange { start, end })
}

/// Cancellation and flow-control state shared by every attempt of one
/// logical request.
struct Link {
    control: Mutex<Control>,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct Control {
    aborted: Option<DispatchError>,
    attempt_abort: Option<AbortHandle>,
    attempt_resume: Option<ResumeHandle>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            control: Mutex::new(Control::default()),
            cancel,
        })
    }

    fn abort_handle(self: &Arc<Self>) -> AbortHandle {
        let link = Arc::clone(self);
        AbortHandle::new(move |reason| link.abort(reason))
    }

    fn resume_handle(self: &Arc<Self>) -> ResumeHandle {
        let link = Arc::clone(self);
        ResumeHandle::new(move || link.resume())
    }

    fn abort(&self, reason: DispatchError) {
        let current = {
            let mut control = self.control.lock().expect(ERR_POISONED_LINK);
            if control.aborted.is_some() {
                return;
            }
            control.aborted = Some(reason.clone());
            control.attempt_abort.clone()
        };
        self.cancel.send_replace(true);
        if let Some(abort) = current {
            abort.abort(reason);
        }
    }

    fn aborted(&self) -> Option<DispatchError> {
        self.control.lock().expect(ERR_POISONED_LINK).aborted.clone()
    }

    /// Track the current attempt's abort handle; returns the abort reason
    /// when the request was aborted already.
    fn attach(&self, abort: AbortHandle) -> Option<DispatchError> {
        let mut control = self.control.lock().expect(ERR_POISONED_LINK);
        control.attempt_abort = Some(abort);
        control.aborted.clone()
    }

    fn set_resume(&self, resume: ResumeHandle) {
        self.control.lock().expect(ERR_POISONED_LINK).attempt_resume = Some(resume);
    }

    fn resume(&self) {
        let resume = self.control.lock().expect(ERR_POISONED_LINK).attempt_resume.clone();
        if let Some(resume) = resume {
            resume.resume();
        }
    }

    /// Forget the current attempt, aborting it with `reason` if given.
    fn detach(&self, reason: Option<DispatchError>) {
        let abort = {
            let mut control = self.control.lock().expect(ERR_POISONED_LINK);
            control.attempt_resume = None;
            control.attempt_abort.take()
        };
        if let (Some(abort), Some(reason)) = (abort, reason) {
            abort.abort(reason);
        }
    }
}

/// The logical request while it is owned by an attempt or a policy.
struct Session {
    caller: Box<dyn DispatchHandler>,
    request: DispatchOptions,
    state: RetryState,
    /// The caller has seen `on_headers`.
    headers_sent: bool,
    /// The delivered body can be continued with a range request.
    resumable: bool,
    signal: Option<(AbortSignal, AbortListenerId)>,
}

impl Session {
    fn release(&mut self) {
        if let Some((signal, listener)) = self.signal.take() {
            signal.remove(listener);
        }
    }

    fn fail(mut self, err: DispatchError) {
        self.release();
        self.caller.on_error(err);
    }

    fn complete(mut self, trailers: HeaderMap) {
        self.release();
        self.caller.on_complete(trailers);
    }

    fn retry_error(&self, message: impl Into<String>, status: StatusCode, headers: &HeaderMap) -> DispatchError {
        RequestRetryError::new(message, Some(status), Some(headers.clone()), self.state.attempt + 1).into()
    }

    /// Options for the next attempt.
    fn next_request(&self) -> DispatchOptions {
        let mut request = self.request.clone();
        if !self.headers_sent {
            return request;
        }

        let range = match self.state.end {
            Some(end) => format!("bytes={}-{}", self.state.bytes_received, end),
            None => format!("bytes={}-", self.state.bytes_received),
        };
        if let Ok(value) = HeaderValue::try_from(range) {
            request.headers.insert(RANGE, value);
        }
        if let Some(value) = self.state.etag.as_deref().and_then(|etag| HeaderValue::from_str(etag).ok()) {
            request.headers.insert(IF_MATCH, value);
        }
        request
    }

    /// Remember where the body can be resumed from.
    fn record_resume_point(&mut self, headers: &HeaderMap) {
        let etag = headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .filter(|etag| !etag.starts_with("W/"))
            .map(String::from);
        let Some(etag) = etag else {
            return;
        };

        let range = headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range);
        let (start, end) = match range {
            Some(range) => (range.start, Some(range.end)),
            None => {
                let length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok());
                (0, length.filter(|length| *length > 0).map(|length| length - 1))
            }
        };

        self.state.bytes_received = start;
        self.state.end = end;
        self.state.etag = Some(etag);
        self.resumable = true;
    }
}

struct RetryShared {
    options: RetryOptions,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RetryShared {
    fn attempt(self: &Arc<Self>, link: Arc<Link>, session: Session) -> bool {
        let request = session.next_request();
        let attempt = RetryAttempt {
            shared: Arc::clone(self),
            link,
            session: Some(session),
        };
        self.dispatcher.dispatch(request, Box::new(attempt))
    }

    fn retry(self: &Arc<Self>, link: Arc<Link>, mut session: Session, err: DispatchError) {
        session.state.attempt += 1;
        tracing::debug!(
            attempt = session.state.attempt,
            code = err.code(),
            origin = %session.request.origin_str(),
            "Attempt failed"
        );

        let state = session.state.clone();
        let method = session.request.method.clone();
        let ctx = RetryContext {
            state: &state,
            options: &self.options,
            method: &method,
            cancel: link.cancel.subscribe(),
        };
        let done = RetryCallback {
            continuation: Some(Continuation {
                shared: Arc::clone(self),
                link,
                session,
            }),
        };
        self.options.policy.retry(&err, ctx, done);
    }
}

struct Continuation {
    shared: Arc<RetryShared>,
    link: Arc<Link>,
    session: Session,
}

impl Continuation {
    fn finish(self, err: Option<DispatchError>) {
        if let Some(reason) = self.link.aborted() {
            return self.session.fail(reason);
        }
        match err {
            Some(err) => self.session.fail(err),
            None => {
                self.shared.attempt(self.link, self.session);
            }
        }
    }
}

/// Handler for one attempt.
struct RetryAttempt {
    shared: Arc<RetryShared>,
    link: Arc<Link>,
    session: Option<Session>,
}

impl RetryAttempt {
    /// Stop this attempt and fail the logical request.
    fn terminate(&mut self, err: DispatchError) {
        if let Some(session) = self.session.take() {
            self.link.detach(Some(err.clone()));
            session.fail(err);
        }
    }

    /// Stop this attempt and let the policy decide.
    fn hand_off(&mut self, err: DispatchError) {
        if let Some(session) = self.session.take() {
            self.link.detach(Some(err.clone()));
            self.shared.retry(Arc::clone(&self.link), session, err);
        }
    }

    fn on_resumed_headers(&mut self, status: StatusCode, headers: &HeaderMap) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };

        // Nothing was delivered yet, so a full response restarts the body.
        let restart = status == StatusCode::OK && session.state.bytes_received == 0;
        if status != StatusCode::PARTIAL_CONTENT && !restart {
            let err = session.retry_error(
                "server does not support the range header and the payload was partially consumed",
                status,
                headers,
            );
            self.terminate(err);
            return false;
        }

        let etag = headers.get(ETAG).and_then(|value| value.to_str().ok());
        if session.state.etag.is_some() && session.state.etag.as_deref() != etag {
            let err = session.retry_error("ETag mismatch", status, headers);
            self.terminate(err);
            return false;
        }

        if restart {
            tracing::debug!(origin = %session.request.origin_str(), "Restarting response body");
            return true;
        }

        let range = headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range);
        let continues = range.is_some_and(|range| {
            range.start == session.state.bytes_received && session.state.end.map_or(true, |end| range.end == end)
        });
        if !continues {
            let err = session.retry_error("Content-Range mismatch", status, headers);
            self.terminate(err);
            return false;
        }

        tracing::debug!(
            offset = session.state.bytes_received,
            origin = %session.request.origin_str(),
            "Resuming response body"
        );
        true
    }
}

impl DispatchHandler for RetryAttempt {
    fn on_connect(&mut self, abort: AbortHandle) {
        if self.session.is_none() {
            return;
        }
        if let Some(reason) = self.link.attach(abort.clone()) {
            abort.abort(reason);
        }
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap, resume: ResumeHandle) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        self.link.set_resume(resume);

        // Resume attempts keep their range state through the policy.
        if self.shared.options.status_codes.contains(&status.as_u16()) {
            let err = session.retry_error("Request failed", status, headers);
            self.hand_off(err);
            return false;
        }

        if session.headers_sent {
            return self.on_resumed_headers(status, headers);
        }

        if status.is_success() {
            session.record_resume_point(headers);
        }
        session.headers_sent = true;
        let resume = self.link.resume_handle();
        session.caller.on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.state.bytes_received += chunk.len() as u64;
        session.caller.on_data(chunk)
    }

    fn on_complete(&mut self, trailers: HeaderMap) {
        if let Some(session) = self.session.take() {
            self.link.detach(None);
            session.complete(trailers);
        }
    }

    fn on_error(&mut self, err: DispatchError) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.link.detach(None);

        if let Some(reason) = self.link.aborted() {
            return session.fail(reason);
        }
        if session.headers_sent && !session.resumable {
            return session.fail(err);
        }
        self.shared.retry(Arc::clone(&self.link), session, err);
    }
}

impl Drop for RetryAttempt {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.fail(DispatchError::Other("dispatcher dropped the request".into()));
        }
    }
}

/// Dispatcher wrapper retrying failed requests.
pub struct Retry<D> {
    inner: Arc<D>,
    shared: Arc<RetryShared>,
}

impl<D: Dispatcher + 'static> Retry<D> {
    pub fn new(inner: D, options: RetryOptions) -> DispatchResult<Self> {
        options.validate()?;
        Ok(Self::from_parts(inner, options))
    }

    fn from_parts(inner: D, options: RetryOptions) -> Self {
        let inner = Arc::new(inner);
        let dispatcher: Arc<dyn Dispatcher> = inner.clone();
        Self {
            inner,
            shared: Arc::new(RetryShared { options, dispatcher }),
        }
    }

    pub fn get_ref(&self) -> &D {
        &self.inner
    }
}

impl<D: Dispatcher + 'static> Dispatcher for Retry<D> {
    fn id(&self) -> DispatcherId {
        self.inner.id()
    }

    fn dispatch(&self, options: DispatchOptions, mut handler: Box<dyn DispatchHandler>) -> bool {
        let link = Link::new();
        handler.on_connect(link.abort_handle());

        let signal = options.signal.clone().and_then(|signal| {
            let listener = {
                let link = Arc::clone(&link);
                signal.on_abort(move |reason| link.abort(reason))
            };
            listener.map(|listener| (signal, listener))
        });

        let mut session = Session {
            caller: handler,
            request: options,
            state: RetryState::default(),
            headers_sent: false,
            resumable: false,
            signal,
        };
        if let Some(reason) = link.aborted() {
            session.release();
            session.caller.on_error(reason);
            return false;
        }

        self.shared.attempt(link, session)
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

/// `tower::Layer` producing retry interceptors.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    options: RetryOptions,
}

impl RetryLayer {
    pub fn new(options: RetryOptions) -> DispatchResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }
}

impl<D: Dispatcher + 'static> tower::Layer<D> for RetryLayer {
    type Service = Retry<D>;

    fn layer(&self, inner: D) -> Self::Service {
        Retry::from_parts(inner, self.options.clone())
    }
}
