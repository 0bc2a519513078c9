//! Retry interceptor tests: status and network retries, body resumption.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatch_resilience::dispatcher::{AbortSignal, DispatchOptions, Dispatcher};
use dispatch_resilience::error::DispatchError;
use dispatch_resilience::http::{ClientOptions, HttpClient};
use dispatch_resilience::resilience::{Retry, RetryOptions};
use http::Method;

mod common;

use common::{outcome, start_programmable_backend, try_outcome, MockDispatcher, RecordedRequest, Reply, ResponseCollector};

const ETAG: &str = "\"v1\"";

fn fast_retries() -> RetryOptions {
    RetryOptions {
        min_timeout: Duration::from_millis(10),
        max_timeout: Duration::from_millis(100),
        ..RetryOptions::default()
    }
}

fn retrying_client(addr: std::net::SocketAddr, options: RetryOptions) -> Retry<HttpClient> {
    let client = HttpClient::new(&format!("http://{addr}"), ClientOptions::default()).unwrap();
    Retry::new(client, options).unwrap()
}

#[tokio::test]
async fn test_recovers_from_hangup_and_server_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            match call {
                0 => Reply::Hangup,
                1 => Reply::status(500, "boom"),
                _ => Reply::status(200, "hello"),
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/resource"), handler);

    let response = outcome(rx).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_resumes_truncated_body_with_range_request() {
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let addr = start_programmable_backend(move |request: RecordedRequest| {
        let index = request.index;
        seen.lock().unwrap().push(request);
        async move {
            if index == 0 {
                Reply::Truncate {
                    status: 200,
                    headers: vec![("ETag", ETAG.to_string())],
                    body: b"abcdef".to_vec(),
                    sent: 3,
                }
            } else {
                Reply::Respond {
                    status: 206,
                    headers: vec![("ETag", ETAG.to_string()), ("Content-Range", "bytes 3-5/6".to_string())],
                    body: b"def".to_vec(),
                }
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/file"), handler);

    let response = outcome(rx).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body, b"abcdef");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("range"), None);
    assert_eq!(requests[1].header("range").as_deref(), Some("bytes=3-5"));
    assert_eq!(requests[1].header("if-match").as_deref(), Some(ETAG));
}

#[tokio::test]
async fn test_retryable_status_during_resume_keeps_range() {
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let addr = start_programmable_backend(move |request: RecordedRequest| {
        let index = request.index;
        seen.lock().unwrap().push(request);
        async move {
            match index {
                0 => Reply::Truncate {
                    status: 200,
                    headers: vec![("ETag", ETAG.to_string())],
                    body: b"abcdef".to_vec(),
                    sent: 3,
                },
                1 => Reply::status(503, "busy"),
                _ => Reply::Respond {
                    status: 206,
                    headers: vec![("ETag", ETAG.to_string()), ("Content-Range", "bytes 3-5/6".to_string())],
                    body: b"def".to_vec(),
                },
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/file"), handler);

    let response = outcome(rx).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body, b"abcdef");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    for request in &requests[1..] {
        assert_eq!(request.header("range").as_deref(), Some("bytes=3-5"));
        assert_eq!(request.header("if-match").as_deref(), Some(ETAG));
    }
}

#[tokio::test]
async fn test_full_response_restarts_empty_body() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let headers = vec![("ETag", ETAG.to_string())];
            if call == 0 {
                Reply::Truncate {
                    status: 200,
                    headers,
                    body: b"abcdef".to_vec(),
                    sent: 0,
                }
            } else {
                Reply::Respond {
                    status: 200,
                    headers,
                    body: b"abcdef".to_vec(),
                }
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/file"), handler);

    let response = outcome(rx).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body, b"abcdef");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_etag_mismatch_fails_resumption() {
    let addr = start_programmable_backend(move |request: RecordedRequest| async move {
        if request.index == 0 {
            Reply::Truncate {
                status: 200,
                headers: vec![("ETag", ETAG.to_string())],
                body: b"abcdef".to_vec(),
                sent: 3,
            }
        } else {
            Reply::Respond {
                status: 206,
                headers: vec![("ETag", "\"v2\"".to_string()), ("Content-Range", "bytes 3-5/6".to_string())],
                body: b"xyz".to_vec(),
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/file"), handler);

    match outcome(rx).await {
        Err(DispatchError::Retry(err)) => {
            assert!(err.to_string().contains("ETag mismatch"));
            assert_eq!(err.status.map(|s| s.as_u16()), Some(206));
        }
        other => panic!("expected ETag mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_body_without_etag_is_not_resumed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            Reply::Truncate {
                status: 200,
                headers: Vec::new(),
                body: b"abcdef".to_vec(),
                sent: 3,
            }
        }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/file"), handler);

    assert!(matches!(outcome(rx).await, Err(DispatchError::Socket(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_surface_last_status() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Reply::status(503, "busy") }
    })
    .await;

    let retry = retrying_client(
        addr,
        RetryOptions {
            max_retries: 2,
            ..fast_retries()
        },
    );
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/"), handler);

    match outcome(rx).await {
        Err(DispatchError::Retry(err)) => {
            assert_eq!(err.status.map(|s| s.as_u16()), Some(503));
            assert_eq!(err.attempts, 3);
        }
        other => panic!("expected retry error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_non_idempotent_method_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let addr = start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Reply::status(502, "bad gateway") }
    })
    .await;

    let retry = retrying_client(addr, fast_retries());
    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::new(Method::POST, "/orders").with_body("{}"), handler);

    assert!(matches!(outcome(rx).await, Err(DispatchError::Retry(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_custom_policy_decides() {
    let member = MockDispatcher::new("http://mock.test", 10);
    let options = fast_retries().with_policy(|_, ctx, done| {
        if ctx.state.attempt < 2 {
            ctx.schedule(Duration::ZERO, done);
        } else {
            done.done(Some(DispatchError::Other("custom policy gave up".into())));
        }
    });
    let retry = Retry::new(member.clone(), options).unwrap();

    let (handler, rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/"), handler);
    member.fail(DispatchError::Socket("reset".into()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(member.running(), 1);
    member.fail(DispatchError::Socket("reset".into()));

    match outcome(rx).await {
        Err(DispatchError::Other(message)) => assert_eq!(message, "custom policy gave up"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(member.paths().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_backoff() {
    let member = MockDispatcher::new("http://mock.test", 10);
    let retry = Retry::new(
        member.clone(),
        RetryOptions {
            min_timeout: Duration::from_secs(10),
            ..RetryOptions::default()
        },
    )
    .unwrap();

    let signal = AbortSignal::new();
    let (handler, mut rx) = ResponseCollector::new();
    retry.dispatch(DispatchOptions::get("/").with_signal(signal.clone()), handler);
    member.fail(DispatchError::Socket("reset".into()));
    assert!(try_outcome(&mut rx).is_none());

    signal.abort();
    assert!(matches!(outcome(rx).await, Err(DispatchError::Aborted)));
    assert_eq!(member.paths().len(), 1);
}
