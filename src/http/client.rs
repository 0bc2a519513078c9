//! Leaf dispatcher over hyper's pooled HTTP/1.1 client.
//!
//! # Responsibilities
//! - Adapt hyper's request/response future to the handler callbacks
//! - Bound in-flight requests by `pipelining`, queueing the overflow
//! - Emit connect, disconnect, connection error and drain events
//! - Enforce header and body timeouts; honour abort handles and signals
//!
//! # Data Flow
//! ```text
//! offer/dispatch → admit (running < pipelining) → spawned task:
//!     on_connect(abort) → client.request → on_headers → on_data* → on_complete
//!                                      ↘ on_error (refused, socket, timeout, abort)
//! task end → start next pending → drain event when capacity returns
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use http::{HeaderMap, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::{oneshot, watch, Notify};

use crate::dispatcher::{
    AbortHandle, DispatchHandler, DispatchOptions, DispatchRequest, Dispatcher, DispatcherEvent, DispatcherId,
    DispatcherListener, DispatcherStats, DrainWaiter, Listeners, ResumeHandle, SubscriptionId,
};
use crate::error::{DispatchError, DispatchResult};
use crate::load_balancer::queue::Queue;
use crate::load_balancer::upstream::normalize_origin;

const ERR_POISONED_CLIENT: &str = "client state mutex poisoned";

/// Connection-level options for a single-origin client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Maximum requests in flight at once.
    pub pipelining: usize,
    pub connect_timeout: Duration,
    /// Deadline for the response head.
    pub headers_timeout: Duration,
    /// Maximum idle time between body frames.
    pub body_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipelining: 1,
            connect_timeout: Duration::from_secs(10),
            headers_timeout: Duration::from_secs(300),
            body_timeout: Duration::from_secs(300),
        }
    }
}

type AbortSender = watch::Sender<Option<DispatchError>>;
type AbortReceiver = watch::Receiver<Option<DispatchError>>;

#[derive(Default)]
struct ClientState {
    running: usize,
    /// Requests accepted through `dispatch` while saturated.
    pending: Queue<DispatchRequest>,
    need_drain: bool,
    drain_waiters: Vec<DrainWaiter>,
    connected: bool,
    closed: bool,
    destroyed: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    /// Abort channel of every in-flight request.
    in_flight: HashMap<u64, AbortSender>,
    next_request: u64,
}

impl ClientState {
    fn is_saturated(&self, pipelining: usize) -> bool {
        self.running >= pipelining || !self.pending.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }

    fn admit(&mut self) -> (u64, AbortSender, AbortReceiver) {
        self.running += 1;
        self.next_request += 1;
        let (tx, rx) = watch::channel(None);
        self.in_flight.insert(self.next_request, tx.clone());
        (self.next_request, tx, rx)
    }
}

struct ClientInner {
    id: DispatcherId,
    origin: String,
    options: ClientOptions,
    client: Client<HttpConnector, Full<Bytes>>,
    state: Mutex<ClientState>,
    listeners: Listeners,
}

/// Single-origin HTTP/1.1 dispatcher.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Create a client for a plain `http://` origin.
    pub fn new(origin: &str, options: ClientOptions) -> DispatchResult<Self> {
        if options.pipelining == 0 {
            return Err(DispatchError::InvalidArgument("pipelining must be greater than 0".into()));
        }
        let origin = normalize_origin(origin)?;
        if !origin.starts_with("http://") {
            return Err(DispatchError::InvalidArgument(format!(
                "origin {origin:?} needs a TLS-capable member factory"
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(options.connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .pool_max_idle_per_host(options.pipelining)
            .build(connector);

        tracing::debug!(origin = %origin, pipelining = options.pipelining, "HTTP client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                id: DispatcherId::new(),
                origin,
                options,
                client,
                state: Mutex::new(ClientState::default()),
                listeners: Listeners::new(),
            }),
        })
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect(ERR_POISONED_CLIENT)
    }

    fn targets(&self) -> Vec<DispatcherId> {
        vec![self.id]
    }

    fn launch(self: &Arc<Self>, id: u64, abort: AbortSender, rx: AbortReceiver, request: DispatchRequest) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn(async move { inner.run(id, abort, rx, request).await });
            }
            Err(_) => {
                let mut handler = request.handler;
                handler.on_error(DispatchError::Other("no tokio runtime available to run the request".into()));
                self.finish(id);
            }
        }
    }

    async fn run(self: Arc<Self>, id: u64, abort: AbortSender, mut rx: AbortReceiver, request: DispatchRequest) {
        let DispatchRequest { options, mut handler } = request;

        let handle = {
            let abort = abort.clone();
            AbortHandle::new(move |reason| send_abort(&abort, reason))
        };
        handler.on_connect(handle);

        let signal_listener = options.signal.as_ref().and_then(|signal| {
            let abort = abort.clone();
            signal.on_abort(move |reason| send_abort(&abort, reason))
        });

        let outcome = self.exchange(&options, handler.as_mut(), &mut rx).await;

        if let (Some(signal), Some(listener)) = (options.signal.as_ref(), signal_listener) {
            signal.remove(listener);
        }
        match outcome {
            Ok(trailers) => handler.on_complete(trailers),
            Err(err) => {
                tracing::debug!(origin = %self.origin, error = %err, "Request failed");
                handler.on_error(err);
            }
        }
        self.finish(id);
    }

    async fn exchange(
        &self,
        options: &DispatchOptions,
        handler: &mut dyn DispatchHandler,
        abort: &mut AbortReceiver,
    ) -> DispatchResult<HeaderMap> {
        if let Some(reason) = abort_reason(abort) {
            return Err(reason);
        }
        let request = build_request(&self.origin, options)?;

        let response = tokio::select! {
            reason = aborted(abort) => return Err(reason),
            result = tokio::time::timeout(self.options.headers_timeout, self.client.request(request)) => match result {
                Err(_) => return Err(DispatchError::HeadersTimeout),
                Ok(Err(err)) => return Err(self.on_transport_error(&err)),
                Ok(Ok(response)) => response,
            },
        };
        self.on_connected();

        let (parts, mut body) = response.into_parts();
        let resume = Arc::new(Notify::new());
        let handle = {
            let resume = Arc::clone(&resume);
            ResumeHandle::new(move || resume.notify_one())
        };
        let mut paused = !handler.on_headers(parts.status, &parts.headers, handle);
        if let Some(reason) = abort_reason(abort) {
            return Err(reason);
        }

        let mut trailers = HeaderMap::new();
        loop {
            if paused {
                tokio::select! {
                    reason = aborted(abort) => return Err(reason),
                    _ = resume.notified() => paused = false,
                }
            }

            let frame = tokio::select! {
                reason = aborted(abort) => return Err(reason),
                frame = tokio::time::timeout(self.options.body_timeout, body.frame()) => match frame {
                    Err(_) => return Err(DispatchError::BodyTimeout),
                    Ok(None) => break,
                    Ok(Some(Err(err))) => return Err(self.on_body_error(&err)),
                    Ok(Some(Ok(frame))) => frame,
                },
            };

            match frame.into_data() {
                Ok(data) if !data.is_empty() => paused = !handler.on_data(data),
                Ok(_) => {}
                Err(frame) => {
                    if let Ok(received) = frame.into_trailers() {
                        trailers = received;
                    }
                }
            }
            if let Some(reason) = abort_reason(abort) {
                return Err(reason);
            }
        }

        Ok(trailers)
    }

    fn on_connected(&self) {
        let first = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.connected, true)
        };
        if first {
            tracing::debug!(origin = %self.origin, "Connected");
            self.listeners.emit(&DispatcherEvent::Connect {
                origin: self.origin.clone(),
                targets: self.targets(),
            });
        }
    }

    fn on_transport_error(&self, err: &hyper_util::client::legacy::Error) -> DispatchError {
        if err.is_connect() {
            let error = DispatchError::ConnectionRefused(error_chain(err));
            tracing::debug!(origin = %self.origin, error = %error, "Connection failed");
            self.listeners.emit(&DispatcherEvent::ConnectionError {
                origin: self.origin.clone(),
                targets: self.targets(),
                error: error.clone(),
            });
            error
        } else {
            self.on_socket_error(error_chain(err))
        }
    }

    fn on_body_error(&self, err: &hyper::Error) -> DispatchError {
        if err.is_incomplete_message() {
            self.on_socket_error(format!("other side closed before the body completed: {}", error_chain(err)))
        } else {
            self.on_socket_error(error_chain(err))
        }
    }

    fn on_socket_error(&self, message: String) -> DispatchError {
        let error = DispatchError::Socket(message);
        let was_connected = std::mem::replace(&mut self.lock().connected, false);
        if was_connected {
            self.listeners.emit(&DispatcherEvent::Disconnect {
                origin: self.origin.clone(),
                targets: self.targets(),
                error: error.clone(),
            });
        }
        error
    }

    /// Settle bookkeeping for a finished request and start the next one.
    fn finish(self: &Arc<Self>, id: u64) {
        let pipelining = self.options.pipelining;
        let (next, waiters, emit_drain, close_waiters) = {
            let mut state = self.lock();
            state.in_flight.remove(&id);
            state.running = state.running.saturating_sub(1);

            let next = if state.destroyed || state.running >= pipelining {
                None
            } else {
                state.pending.shift().map(|request| {
                    let (next_id, tx, rx) = state.admit();
                    (next_id, tx, rx, request)
                })
            };

            let (waiters, emit_drain) = if !state.destroyed && !state.is_saturated(pipelining) && state.need_drain {
                state.need_drain = false;
                (std::mem::take(&mut state.drain_waiters), true)
            } else {
                (Vec::new(), false)
            };
            let close_waiters = if state.closed && state.is_idle() {
                std::mem::take(&mut state.close_waiters)
            } else {
                Vec::new()
            };
            (next, waiters, emit_drain, close_waiters)
        };

        if let Some((next_id, tx, rx, request)) = next {
            self.launch(next_id, tx, rx, request);
        }
        for waiter in waiters {
            waiter.notify(None);
        }
        if emit_drain {
            self.listeners.emit(&DispatcherEvent::Drain {
                origin: self.origin.clone(),
                targets: self.targets(),
            });
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }
}

fn send_abort(abort: &AbortSender, reason: DispatchError) {
    abort.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

fn abort_reason(abort: &AbortReceiver) -> Option<DispatchError> {
    abort.borrow().clone()
}

/// Resolves once the request is aborted.
async fn aborted(abort: &mut AbortReceiver) -> DispatchError {
    loop {
        if let Some(reason) = abort_reason(abort) {
            return reason;
        }
        if abort.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn build_request(origin: &str, options: &DispatchOptions) -> DispatchResult<Request<Full<Bytes>>> {
    let separator = if options.path.starts_with('/') { "" } else { "/" };
    let uri: Uri = format!("{origin}{separator}{}", options.path)
        .parse()
        .map_err(|e| DispatchError::InvalidArgument(format!("invalid request path {:?}: {e}", options.path)))?;

    let mut builder = Request::builder().method(options.method.clone()).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(options.headers.clone());
    }
    builder
        .body(Full::new(options.body.clone().unwrap_or_default()))
        .map_err(|e| DispatchError::InvalidArgument(e.to_string()))
}

impl Dispatcher for HttpClient {
    fn id(&self) -> DispatcherId {
        self.inner.id
    }

    fn dispatch(&self, options: DispatchOptions, mut handler: Box<dyn DispatchHandler>) -> bool {
        let started = {
            let mut state = self.inner.lock();
            if state.destroyed || state.closed {
                let err = if state.destroyed { DispatchError::Destroyed } else { DispatchError::Closed };
                drop(state);
                handler.on_error(err);
                return false;
            }
            if state.is_saturated(self.inner.options.pipelining) {
                state.need_drain = true;
                state.pending.push(DispatchRequest::new(options, handler));
                return false;
            }
            state.admit()
        };

        let (id, tx, rx) = started;
        self.inner.launch(id, tx, rx, DispatchRequest::new(options, handler));
        true
    }

    fn offer(
        &self,
        options: DispatchOptions,
        mut handler: Box<dyn DispatchHandler>,
        waiter: Option<DrainWaiter>,
    ) -> Result<(), DispatchRequest> {
        let started = {
            let mut state = self.inner.lock();
            if state.destroyed || state.closed {
                let err = if state.destroyed { DispatchError::Destroyed } else { DispatchError::Closed };
                drop(state);
                handler.on_error(err);
                return Ok(());
            }
            if state.is_saturated(self.inner.options.pipelining) {
                state.need_drain = true;
                state.drain_waiters.extend(waiter);
                return Err(DispatchRequest::new(options, handler));
            }
            state.admit()
        };

        let (id, tx, rx) = started;
        self.inner.launch(id, tx, rx, DispatchRequest::new(options, handler));
        Ok(())
    }

    fn close(&self) -> BoxFuture<'static, DispatchResult<()>> {
        let rx = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return future::ready(Err(DispatchError::Destroyed)).boxed();
            }
            state.closed = true;
            if state.is_idle() {
                return future::ready(Ok(())).boxed();
            }
            let (tx, rx) = oneshot::channel();
            state.close_waiters.push(tx);
            rx
        };
        async move {
            let _ = rx.await;
            Ok(())
        }
        .boxed()
    }

    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()> {
        let err = err.unwrap_or(DispatchError::Destroyed);
        let (pending, in_flight, waiters, close_waiters, connected, rx) = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return future::ready(()).boxed();
            }
            state.destroyed = true;
            state.closed = true;
            let pending = state.pending.drain();
            let in_flight: Vec<AbortSender> = state.in_flight.values().cloned().collect();
            let waiters = std::mem::take(&mut state.drain_waiters);
            let close_waiters = std::mem::take(&mut state.close_waiters);
            let connected = std::mem::replace(&mut state.connected, false);
            let rx = if state.running > 0 {
                let (tx, rx) = oneshot::channel();
                state.close_waiters.push(tx);
                Some(rx)
            } else {
                None
            };
            (pending, in_flight, waiters, close_waiters, connected, rx)
        };

        for abort in &in_flight {
            send_abort(abort, err.clone());
        }
        for mut request in pending {
            request.handler.on_error(err.clone());
        }
        for waiter in waiters {
            waiter.notify(Some(err.clone()));
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
        if connected {
            self.inner.listeners.emit(&DispatcherEvent::Disconnect {
                origin: self.inner.origin.clone(),
                targets: self.inner.targets(),
                error: err,
            });
        }

        async move {
            if let Some(rx) = rx {
                let _ = rx.await;
            }
        }
        .boxed()
    }

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        self.inner.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    fn stats(&self) -> DispatcherStats {
        let state = self.inner.lock();
        let free = state.connected && !state.is_saturated(self.inner.options.pipelining);
        DispatcherStats {
            connected: usize::from(state.connected),
            free: usize::from(free),
            pending: state.pending.len(),
            queued: 0,
            running: state.running,
            size: state.running + state.pending.len(),
        }
    }

    fn is_busy(&self) -> bool {
        self.inner.lock().is_saturated(self.inner.options.pipelining)
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_uri() {
        let options = DispatchOptions::get("/items?page=2").with_body("x");
        let request = build_request("http://127.0.0.1:8080", &options).unwrap();
        assert_eq!(request.uri().to_string(), "http://127.0.0.1:8080/items?page=2");

        let options = DispatchOptions::get("relative");
        let request = build_request("http://127.0.0.1:8080", &options).unwrap();
        assert_eq!(request.uri().path(), "/relative");
    }

    #[test]
    fn test_rejects_tls_origin_and_zero_pipelining() {
        assert!(HttpClient::new("https://example.com", ClientOptions::default()).is_err());
        let options = ClientOptions {
            pipelining: 0,
            ..ClientOptions::default()
        };
        assert!(HttpClient::new("http://example.com", options).is_err());
    }

    #[test]
    fn test_dispatch_without_runtime_fails_handler() {
        struct Record(Arc<Mutex<Option<DispatchError>>>);
        impl DispatchHandler for Record {
            fn on_headers(&mut self, _: http::StatusCode, _: &HeaderMap, _: ResumeHandle) -> bool {
                true
            }
            fn on_data(&mut self, _: Bytes) -> bool {
                true
            }
            fn on_complete(&mut self, _: HeaderMap) {}
            fn on_error(&mut self, err: DispatchError) {
                *self.0.lock().unwrap() = Some(err);
            }
        }

        let client = HttpClient::new("http://127.0.0.1:9", ClientOptions::default()).unwrap();
        let seen = Arc::new(Mutex::new(None));
        client.dispatch(DispatchOptions::get("/"), Box::new(Record(seen.clone())));
        assert!(seen.lock().unwrap().is_some());
        assert_eq!(client.stats().running, 0);
    }
}
