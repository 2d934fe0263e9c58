//! In-process mock of the control plane for local testing. Debug builds
//! only.
//!
//! The server multiplexes two client populations over one listener: the
//! runtime long-polling `GET /invocation/next` and posting results, and a
//! test client posting events to `/invoke`. The two sides rendezvous
//! through a pair of [`Pool`]s; correlation between an `/invoke` and its
//! result relies on the strict one-at-a-time sequencing of the invocation
//! loop, not on per-request matching. One test client at a time.

use crate::pool::{Pool, PoolFull};
use crate::{Config, Error};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use lambda_bootstrap_client::{synthesize_trace_id, RequestId, API_PREFIX};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

const LOCAL_FUNCTION_ARN: &str = "arn:aws:lambda:us-east-1:012345678912:function:local";
const INVOCATION_LIFETIME_MS: u64 = 60_000;

/// The control-plane mock. Bind it on the endpoint the runtime would poll,
/// then [`serve`](LocalServer::serve) it alongside the invocation loop.
pub struct LocalServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    invoke_endpoint: String,
    invocations: Pool<Bytes>,
    results: Pool<InvocationResult>,
    in_flight: Mutex<Option<RequestId>>,
    clock: AtomicU64,
}

struct InvocationResult {
    kind: ResultKind,
    body: Bytes,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Success,
    Failure,
}

impl LocalServer {
    /// Bind the listener on the configured control-plane endpoint.
    pub async fn bind(config: &Config) -> Result<LocalServer, Error> {
        let listener = TcpListener::bind(config.api_endpoint).await?;
        tracing::info!(endpoint = %listener.local_addr()?, "local control plane listening");
        Ok(LocalServer {
            listener,
            shared: Arc::new(Shared {
                invoke_endpoint: config.invoke_endpoint.clone(),
                invocations: Pool::new(),
                results: Pool::new(),
                in_flight: Mutex::new(None),
                clock: AtomicU64::new(0),
            }),
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the surrounding task is dropped.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let service =
                    service_fn(move |request| handle_request(shared.clone(), request));
                let connection = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service);
                if let Err(err) = connection.await {
                    tracing::debug!(error = %err, "local server connection closed");
                }
            });
        }
    }
}

async fn handle_request(
    shared: Arc<Shared>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let body = request.into_body().collect().await?.to_bytes();

    if method == Method::POST && path == shared.invoke_endpoint {
        return Ok(invoke(&shared, body).await);
    }

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return Ok(status_only(StatusCode::NOT_FOUND));
    };
    let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
    match segments.as_slice() {
        ["invocation", "next"] if method == Method::GET => Ok(next_invocation(&shared).await),
        ["invocation", id, "response"] if method == Method::POST => {
            Ok(deliver_result(&shared, id, ResultKind::Success, body))
        }
        ["invocation", id, "error"] if method == Method::POST => {
            Ok(deliver_result(&shared, id, ResultKind::Failure, body))
        }
        ["init", "error"] if method == Method::POST => {
            tracing::error!(
                body = %String::from_utf8_lossy(&body),
                "runtime reported an initialization error"
            );
            Ok(status_only(StatusCode::ACCEPTED))
        }
        _ => Ok(status_only(StatusCode::NOT_FOUND)),
    }
}

/// Test-client side: enqueue the event and block until the handler's result
/// comes back through the results pool.
async fn invoke(shared: &Shared, body: Bytes) -> Response<Full<Bytes>> {
    if shared.invocations.push(body).is_err() {
        return status_only(StatusCode::SERVICE_UNAVAILABLE);
    }
    let result = shared.results.next().await;
    let status = match result.kind {
        ResultKind::Success => StatusCode::OK,
        ResultKind::Failure => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Response::builder()
        .status(status)
        .body(Full::new(result.body))
        .expect("static response")
}

/// Handler side: long-poll until a test client posts an event.
async fn next_invocation(shared: &Shared) -> Response<Full<Bytes>> {
    let payload = shared.invocations.next().await;
    let request_id = mint_request_id(&shared.clock);
    *shared.in_flight.lock().expect("in-flight lock") = Some(request_id);
    let deadline_ms = now_ms() + INVOCATION_LIFETIME_MS;
    Response::builder()
        .status(StatusCode::OK)
        .header("Lambda-Runtime-Aws-Request-Id", request_id.to_string())
        .header("Lambda-Runtime-Deadline-Ms", deadline_ms.to_string())
        .header("Lambda-Runtime-Invoked-Function-Arn", LOCAL_FUNCTION_ARN)
        .header("Lambda-Runtime-Trace-Id", synthesize_trace_id())
        .body(Full::new(payload))
        .expect("static response")
}

/// Handler side: acknowledge the result and wake the waiting `/invoke`.
fn deliver_result(
    shared: &Shared,
    id: impl AsRef<str>,
    kind: ResultKind,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let id = id.as_ref();
    {
        let in_flight = shared.in_flight.lock().expect("in-flight lock");
        let expected = in_flight.map(|id| id.to_string());
        if expected.as_deref() != Some(id) {
            // logged, not retried: sequencing keeps the pools aligned even
            // when a stale id shows up
            tracing::warn!(
                received = id,
                expected = expected.as_deref().unwrap_or("<none>"),
                "result does not correlate with the invocation in flight"
            );
        }
    }
    match shared.results.push(InvocationResult { kind, body }) {
        Ok(()) => status_only(StatusCode::ACCEPTED),
        Err(PoolFull) => status_only(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Mint a fresh id, strictly increasing even when the clock stalls.
fn mint_request_id(clock: &AtomicU64) -> RequestId {
    let now = now_ms();
    let mut previous = clock.load(Ordering::Relaxed);
    let fresh = loop {
        let candidate = now.max(previous + 1);
        match clock.compare_exchange(previous, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break candidate,
            Err(actual) => previous = actual,
        }
    };
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&fresh.to_be_bytes());
    RequestId::from_bytes(bytes)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_strictly_increasing() {
        let clock = AtomicU64::new(0);
        let mut previous = None;
        for _ in 0..100 {
            let id = mint_request_id(&clock).to_string();
            if let Some(previous) = &previous {
                assert!(id > *previous, "{id} should sort after {previous}");
            }
            previous = Some(id);
        }
    }

    #[test]
    fn minted_ids_parse_as_request_ids() {
        let clock = AtomicU64::new(0);
        let id = mint_request_id(&clock);
        assert_eq!(RequestId::parse(&id.to_string()), Some(id));
    }
}
