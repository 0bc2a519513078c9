//! Request options and the owned request unit that pools queue.

use std::fmt;

use bytes::Bytes;
use http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method};

use super::handler::DispatchHandler;
use super::signal::AbortSignal;

/// Options describing one outbound request.
///
/// Cloned for every retry attempt, so the body is a replayable `Bytes`.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Target origin (`scheme://host:port`). Pools fill this in for members.
    pub origin: Option<String>,
    pub method: Method,
    /// Path and query, starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Caller-side cancellation.
    pub signal: Option<AbortSignal>,
    /// Opaque data threaded through interceptors untouched.
    pub context: Extensions,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            origin: None,
            method: Method::GET,
            path: "/".to_string(),
            headers: HeaderMap::new(),
            body: None,
            signal: None,
            context: Extensions::new(),
        }
    }
}

impl DispatchOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_context<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.context.insert(value);
        self
    }

    /// Origin or the empty string, for logging and circuit keys.
    pub fn origin_str(&self) -> &str {
        self.origin.as_deref().unwrap_or("")
    }
}

/// A request together with the handler that will observe its outcome.
pub struct DispatchRequest {
    pub options: DispatchOptions,
    pub handler: Box<dyn DispatchHandler>,
}

impl DispatchRequest {
    pub fn new(options: DispatchOptions, handler: Box<dyn DispatchHandler>) -> Self {
        Self { options, handler }
    }
}

impl fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("method", &self.options.method)
            .field("origin", &self.options.origin)
            .field("path", &self.options.path)
            .finish_non_exhaustive()
    }
}
