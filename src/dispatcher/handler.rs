//! Callback contract through which a dispatcher reports one request's outcome.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::DispatchError;

/// Observer of a single request.
///
/// Exactly one of `on_complete` / `on_error` is called, once. `on_headers`
/// and `on_data` return `false` to pause the body until the `ResumeHandle`
/// received in `on_headers` is invoked.
pub trait DispatchHandler: Send {
    /// The request has been handed to a connection. `abort` stops it.
    fn on_connect(&mut self, _abort: AbortHandle) {}

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap, resume: ResumeHandle) -> bool;

    fn on_data(&mut self, chunk: Bytes) -> bool;

    fn on_complete(&mut self, trailers: HeaderMap);

    fn on_error(&mut self, err: DispatchError);
}

impl<H: DispatchHandler + ?Sized> DispatchHandler for Box<H> {
    fn on_connect(&mut self, abort: AbortHandle) {
        (**self).on_connect(abort)
    }

    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap, resume: ResumeHandle) -> bool {
        (**self).on_headers(status, headers, resume)
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        (**self).on_data(chunk)
    }

    fn on_complete(&mut self, trailers: HeaderMap) {
        (**self).on_complete(trailers)
    }

    fn on_error(&mut self, err: DispatchError) {
        (**self).on_error(err)
    }
}

/// Stops an in-flight attempt; the dispatcher then reports `on_error(reason)`.
///
/// Calling it from inside a handler callback is allowed: the error is
/// delivered after that callback returns.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<dyn Fn(DispatchError) + Send + Sync>,
}

impl AbortHandle {
    pub fn new<F>(abort: F) -> Self
    where
        F: Fn(DispatchError) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(abort) }
    }

    /// A handle that ignores aborts.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn abort(&self, reason: DispatchError) {
        (self.inner)(reason)
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// Resumes a paused body.
#[derive(Clone)]
pub struct ResumeHandle {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl ResumeHandle {
    pub fn new<F>(resume: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self { inner: Arc::new(resume) }
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn resume(&self) {
        (self.inner)()
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeHandle")
    }
}
