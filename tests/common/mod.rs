//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dispatch_resilience::dispatcher::{
    AbortHandle, DispatchHandler, DispatchOptions, DispatchRequest, Dispatcher, DispatcherEvent, DispatcherId,
    DispatcherListener, DispatcherStats, DrainWaiter, Listeners, ResumeHandle, SubscriptionId,
};
use dispatch_resilience::error::{DispatchError, DispatchResult};
use dispatch_resilience::http::ClientOptions;
use dispatch_resilience::load_balancer::{MemberFactory, PoolOptions, UpstreamFactory};
use futures_util::future::{self, BoxFuture, FutureExt};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// What a handler observed once it settled.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub type Outcome = Result<Response, DispatchError>;

/// Handler buffering the response and reporting it through a oneshot.
///
/// Panics if settled twice.
pub struct ResponseCollector {
    head: Option<(StatusCode, HeaderMap)>,
    body: Vec<u8>,
    tx: Option<oneshot::Sender<Outcome>>,
}

impl ResponseCollector {
    pub fn new() -> (Box<dyn DispatchHandler>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let collector = Self {
            head: None,
            body: Vec::new(),
            tx: Some(tx),
        };
        (Box::new(collector), rx)
    }

    fn settle(&mut self, outcome: Outcome) {
        let tx = self.tx.take().expect("handler settled twice");
        let _ = tx.send(outcome);
    }
}

impl DispatchHandler for ResponseCollector {
    fn on_headers(&mut self, status: StatusCode, headers: &HeaderMap, _resume: ResumeHandle) -> bool {
        self.head = Some((status, headers.clone()));
        true
    }

    fn on_data(&mut self, chunk: Bytes) -> bool {
        self.body.extend_from_slice(&chunk);
        true
    }

    fn on_complete(&mut self, _trailers: HeaderMap) {
        let (status, headers) = self.head.take().expect("completed without headers");
        let body = std::mem::take(&mut self.body);
        self.settle(Ok(Response { status, headers, body }));
    }

    fn on_error(&mut self, err: DispatchError) {
        self.settle(Err(err));
    }
}

/// Wait for a collector with a deadline.
pub async fn outcome(rx: oneshot::Receiver<Outcome>) -> Outcome {
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("request did not settle in time")
        .expect("handler dropped without settling")
}

/// Non-blocking peek at a collector.
pub fn try_outcome(rx: &mut oneshot::Receiver<Outcome>) -> Option<Outcome> {
    rx.try_recv().ok()
}

struct MockState {
    running: VecDeque<(DispatchOptions, Box<dyn DispatchHandler>)>,
    paths: Vec<String>,
    need_drain: bool,
    drain_waiters: Vec<DrainWaiter>,
    closed: bool,
    destroyed: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

/// In-memory member with a fixed capacity; the test completes requests.
pub struct MockDispatcher {
    id: DispatcherId,
    origin: String,
    capacity: usize,
    state: Mutex<MockState>,
    listeners: Listeners,
}

impl MockDispatcher {
    pub fn new(origin: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: DispatcherId::new(),
            origin: origin.to_string(),
            capacity,
            state: Mutex::new(MockState {
                running: VecDeque::new(),
                paths: Vec::new(),
                need_drain: false,
                drain_waiters: Vec::new(),
                closed: false,
                destroyed: false,
                close_waiters: Vec::new(),
            }),
            listeners: Listeners::new(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Paths of every request this member accepted, in order.
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().paths.clone()
    }

    /// Complete the oldest running request, then drain if needed.
    pub fn respond(&self, status: u16, body: &str) -> bool {
        let Some((_, mut handler)) = self.state.lock().unwrap().running.pop_front() else {
            return false;
        };
        let status = StatusCode::from_u16(status).unwrap();
        handler.on_headers(status, &HeaderMap::new(), ResumeHandle::noop());
        if !body.is_empty() {
            handler.on_data(Bytes::copy_from_slice(body.as_bytes()));
        }
        handler.on_complete(HeaderMap::new());
        self.settled();
        true
    }

    /// Fail the oldest running request with `err`.
    pub fn fail(&self, err: DispatchError) -> bool {
        let Some((_, mut handler)) = self.state.lock().unwrap().running.pop_front() else {
            return false;
        };
        handler.on_error(err);
        self.settled();
        true
    }

    pub fn emit(&self, event: DispatcherEvent) {
        self.listeners.emit(&event);
    }

    pub fn connection_error(&self, err: DispatchError) {
        self.emit(DispatcherEvent::ConnectionError {
            origin: self.origin.clone(),
            targets: vec![self.id],
            error: err,
        });
    }

    fn settled(&self) {
        let (waiters, drain, close_waiters) = {
            let mut state = self.state.lock().unwrap();
            let drain = state.need_drain && state.running.len() < self.capacity;
            if drain {
                state.need_drain = false;
            }
            let waiters = if drain {
                std::mem::take(&mut state.drain_waiters)
            } else {
                Vec::new()
            };
            let close_waiters = if state.closed && state.running.is_empty() {
                std::mem::take(&mut state.close_waiters)
            } else {
                Vec::new()
            };
            (waiters, drain, close_waiters)
        };
        for waiter in waiters {
            waiter.notify(None);
        }
        if drain {
            self.emit(DispatcherEvent::Drain {
                origin: self.origin.clone(),
                targets: vec![self.id],
            });
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }
}

impl Dispatcher for MockDispatcher {
    fn id(&self) -> DispatcherId {
        self.id
    }

    fn dispatch(&self, options: DispatchOptions, handler: Box<dyn DispatchHandler>) -> bool {
        match self.offer(options, handler, None) {
            Ok(()) => true,
            Err(mut refused) => {
                refused.handler.on_error(DispatchError::Other("mock member saturated".into()));
                false
            }
        }
    }

    fn offer(
        &self,
        options: DispatchOptions,
        mut handler: Box<dyn DispatchHandler>,
        waiter: Option<DrainWaiter>,
    ) -> Result<(), DispatchRequest> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.destroyed {
            drop(state);
            handler.on_error(DispatchError::Closed);
            return Ok(());
        }
        if state.running.len() >= self.capacity {
            state.need_drain = true;
            state.drain_waiters.extend(waiter);
            return Err(DispatchRequest::new(options, handler));
        }
        state.paths.push(options.path.clone());
        drop(state);

        handler.on_connect(AbortHandle::noop());
        self.state.lock().unwrap().running.push_back((options, handler));
        Ok(())
    }

    fn close(&self) -> BoxFuture<'static, DispatchResult<()>> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if state.running.is_empty() {
            return future::ready(Ok(())).boxed();
        }
        let (tx, rx) = oneshot::channel();
        state.close_waiters.push(tx);
        async move {
            let _ = rx.await;
            Ok(())
        }
        .boxed()
    }

    fn destroy(&self, err: Option<DispatchError>) -> BoxFuture<'static, ()> {
        let err = err.unwrap_or(DispatchError::Destroyed);
        let (running, waiters, close_waiters) = {
            let mut state = self.state.lock().unwrap();
            state.destroyed = true;
            state.closed = true;
            (
                std::mem::take(&mut state.running),
                std::mem::take(&mut state.drain_waiters),
                std::mem::take(&mut state.close_waiters),
            )
        };
        for (_, mut handler) in running {
            handler.on_error(err.clone());
        }
        for waiter in waiters {
            waiter.notify(Some(err.clone()));
        }
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
        future::ready(()).boxed()
    }

    fn subscribe(&self, listener: Arc<dyn DispatcherListener>) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn stats(&self) -> DispatcherStats {
        let running = self.running();
        DispatcherStats {
            connected: 1,
            free: usize::from(running < self.capacity),
            pending: 0,
            queued: 0,
            running,
            size: running,
        }
    }

    fn is_busy(&self) -> bool {
        self.running() >= self.capacity
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn is_destroyed(&self) -> bool {
        self.state.lock().unwrap().destroyed
    }
}

/// Members created by a `mock_factory`, in creation order.
pub type MockRegistry = Arc<Mutex<Vec<Arc<MockDispatcher>>>>;

/// Member factory producing `MockDispatcher`s of the given capacity.
pub fn mock_factory(capacity: usize) -> (MemberFactory, MockRegistry) {
    let registry: MockRegistry = Arc::new(Mutex::new(Vec::new()));
    let created = registry.clone();
    let factory: MemberFactory = Arc::new(move |origin: &str, _: &ClientOptions| {
        let member = MockDispatcher::new(origin, capacity);
        created.lock().unwrap().push(member.clone());
        let member: Arc<dyn Dispatcher> = member;
        Ok(member)
    });
    (factory, registry)
}

/// Upstream factory producing one `MockDispatcher` per origin.
pub fn mock_upstream_factory(capacity: usize) -> (UpstreamFactory, MockRegistry) {
    let registry: MockRegistry = Arc::new(Mutex::new(Vec::new()));
    let created = registry.clone();
    let factory: UpstreamFactory = Arc::new(move |origin: &str, _: &PoolOptions| {
        let member = MockDispatcher::new(origin, capacity);
        created.lock().unwrap().push(member.clone());
        let member: Arc<dyn Dispatcher> = member;
        Ok(member)
    });
    (factory, registry)
}

/// Find the mock created for `origin`.
pub fn member_for(registry: &MockRegistry, origin: &str) -> Arc<MockDispatcher> {
    registry
        .lock()
        .unwrap()
        .iter()
        .find(|m| m.origin() == origin)
        .cloned()
        .expect("no member for origin")
}

/// Records every event it receives.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<DispatcherEvent>>,
}

impl EventRecorder {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    pub fn events(&self) -> Vec<DispatcherEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl DispatcherListener for EventRecorder {
    fn on_event(&self, event: &DispatcherEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// The request as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Zero-based arrival order.
    pub index: usize,
    pub head: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Programmable backend behaviour for one request.
pub enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    },
    /// Announce the full body, send only its first `sent` bytes, then hang up.
    Truncate {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
        sent: usize,
    },
    /// Read the request and close the socket without answering.
    Hangup,
}

impl Reply {
    pub fn status(status: u16, body: &str) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn response_head(status: u16, headers: &[(&'static str, String)], length: usize) -> String {
    let mut head = format!("HTTP/1.1 {status} {}\r\nContent-Length: {length}\r\nConnection: close\r\n", reason(status));
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Start a programmable mock backend on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(RecordedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let index = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let request = RecordedRequest {
                    index,
                    head: String::from_utf8_lossy(&head).into_owned(),
                };

                match f(request).await {
                    Reply::Respond { status, headers, body } => {
                        let _ = socket.write_all(response_head(status, &headers, body.len()).as_bytes()).await;
                        let _ = socket.write_all(&body).await;
                    }
                    Reply::Truncate {
                        status,
                        headers,
                        body,
                        sent,
                    } => {
                        let _ = socket.write_all(response_head(status, &headers, body.len()).as_bytes()).await;
                        let _ = socket.write_all(&body[..sent.min(body.len())]).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Reply::Hangup => {}
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
