//! Forwarding pipeline
//!
//! Each inbound request draws a key from the pool, is replayed against the
//! upstream API with that key, and has its response relayed back either
//! buffered or line by line. An upstream 429 marks the key and, when
//! failover is enabled, triggers exactly one retry with a freshly selected
//! key.

use crate::config::RetryConfig;
use crate::error::ProxyError;
use crate::metrics;
use crate::relay;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use key_pool::{ApiKey, Pool};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Inbound body cap.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip in both directions (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handlers via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub pool: Arc<Pool>,
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub log_requests: bool,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Counts a request as in flight until dropped. Streamed responses move the
/// guard into the body so the count covers the whole relay.
pub struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ProxyState {
    /// Map a failed selection to the client-facing error.
    fn selection_error(&self, source: key_pool::Error) -> ProxyError {
        if source.is_rate_limited() {
            ProxyError::RateLimited {
                source,
                retry_after: self.pool.retry_after(),
            }
        } else {
            ProxyError::Internal(source.to_string())
        }
    }

    fn fail(&self, err: ProxyError, request_id: &str) -> Response {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let status = err.status();
        if status.is_server_error() {
            error!(error = %err, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %err, status = status.as_u16(), "request rejected");
        }
        err.into_response(request_id)
    }

    fn upstream_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// `POST /v1/chat/completions`
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn chat_completions(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let guard = InFlightGuard::new(state.in_flight.clone());
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match handle_chat(state, request, &request_id, guard).await {
        Ok(response) => response,
        Err(e) => state.fail(e, &request_id),
    };
    metrics::record_request(
        "chat_completions",
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle_chat(
    state: &ProxyState,
    request: Request<Body>,
    request_id: &str,
    guard: InFlightGuard,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidBody(e.to_string()))?;

    let document: Value = serde_json::from_slice(&body)?;
    let stream = document
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let key = state
        .pool
        .select_with_retry(state.retry.max_retries)
        .await
        .map_err(|e| state.selection_error(e))?;

    if state.log_requests {
        let model = document
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(model, stream, key = %key.masked(), request_id, "chat completion request");
    }

    let mut headers = forward_headers(&parts.headers);
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));

    let forwarded = forward(state, Method::POST, "/chat/completions", headers, body, key).await?;
    let upstream = match forwarded {
        Upstream::Live(upstream) => upstream,
        Upstream::Stored(response) => return Ok(response),
    };

    if stream {
        Ok(relay_stream(upstream, guard))
    } else {
        relay_buffered(upstream, state.timeout).await
    }
}

/// `GET /v1/models`
///
/// Takes a single selection attempt unless `retry_model_listing` is set, and
/// never streams.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn list_models(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _guard = InFlightGuard::new(state.in_flight.clone());
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match handle_models(state, request).await {
        Ok(response) => response,
        Err(e) => state.fail(e, &request_id),
    };
    metrics::record_request(
        "models",
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle_models(
    state: &ProxyState,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let selected = if state.retry.retry_model_listing {
        state.pool.select_with_retry(state.retry.max_retries).await
    } else {
        state.pool.select().await
    };
    let key = selected.map_err(|e| state.selection_error(e))?;

    let headers = forward_headers(request.headers());
    match forward(state, Method::GET, "/models", headers, Bytes::new(), key).await? {
        Upstream::Live(upstream) => relay_buffered(upstream, state.timeout).await,
        Upstream::Stored(response) => Ok(response),
    }
}

/// Upstream answer chosen by [`forward`].
enum Upstream {
    /// Body still on the wire, relayed buffered or line by line.
    Live(reqwest::Response),
    /// An upstream 429 already read into memory, relayed as-is.
    Stored(Response),
}

/// Send the request upstream with `key`, failing over once on a 429.
///
/// A transport failure marks the key and becomes a 502 (504 on timeout). A
/// 429 marks the key; with failover enabled a single further selection is
/// made without backoff and the request is re-sent. If no key is available,
/// or the re-send fails at the transport level, the original 429 response is
/// returned unchanged. It is read into memory before the re-send, since its
/// body shares the request deadline with the attempt that produced it.
async fn forward(
    state: &ProxyState,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
    key: Arc<ApiKey>,
) -> Result<Upstream, ProxyError> {
    let url = state.upstream_url(path);

    let response = match send(state, &method, &url, &headers, &body, &key).await {
        Ok(response) => response,
        Err(e) => {
            state.pool.mark_error(&key);
            return Err(transport_error(&e, state.timeout));
        }
    };

    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return Ok(Upstream::Live(response));
    }

    state.pool.mark_error(&key);
    metrics::record_upstream_error("rate_limited");
    warn!(key = %key.masked(), "upstream rejected key with 429");

    if !state.retry.auto_failover {
        return Ok(Upstream::Live(response));
    }

    let original = store_response(response).await;

    let replacement = match state.pool.select().await {
        Ok(replacement) => replacement,
        Err(e) => {
            metrics::record_failover("no_key");
            warn!(error = %e, "failover skipped, returning upstream 429");
            return Ok(Upstream::Stored(original));
        }
    };

    match send(state, &method, &url, &headers, &body, &replacement).await {
        Ok(retried) => {
            metrics::record_failover("succeeded");
            warn!(
                from = %key.masked(),
                to = %replacement.masked(),
                status = retried.status().as_u16(),
                "failed over to another key"
            );
            Ok(Upstream::Live(retried))
        }
        Err(e) => {
            state.pool.mark_error(&replacement);
            metrics::record_upstream_error(transport_kind(&e));
            metrics::record_failover("transport");
            warn!(error = %e, "failover request failed, returning upstream 429");
            Ok(Upstream::Stored(original))
        }
    }
}

/// Read an upstream response fully into a relayable response.
///
/// A body read failure leaves the body empty; status and headers still go
/// back to the caller.
async fn store_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = relay_headers(upstream.headers(), &[header::CONTENT_LENGTH]);
    let body = upstream.bytes().await.unwrap_or_else(|e| {
        metrics::record_upstream_error("body");
        warn!(error = %e, status = status.as_u16(), "failed to read upstream response body");
        Bytes::new()
    });

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn send(
    state: &ProxyState,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
    key: &ApiKey,
) -> reqwest::Result<reqwest::Response> {
    let mut request = state
        .client
        .request(method.clone(), url)
        .headers(headers.clone())
        .bearer_auth(key.secret())
        .timeout(state.timeout);
    if !body.is_empty() {
        request = request.body(body.clone());
    }
    request.send().await
}

fn transport_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else {
        "connect"
    }
}

/// Record a reqwest failure and map it to the client-facing error.
fn transport_error(err: &reqwest::Error, timeout: Duration) -> ProxyError {
    metrics::record_upstream_error(transport_kind(err));
    if err.is_timeout() {
        error!(error = %err, timeout_secs = timeout.as_secs(), "upstream timeout");
        ProxyError::UpstreamTimeout(timeout)
    } else {
        error!(error = %err, "upstream request failed");
        ProxyError::UpstreamUnreachable(err.to_string())
    }
}

/// Inbound headers minus the caller's credentials, `Host`, `Content-Length`
/// (recomputed by the client) and hop-by-hop headers.
fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if *name == header::AUTHORIZATION
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || is_hop_by_hop(name.as_str())
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Copy upstream response headers, stripping hop-by-hop and `skip`.
fn relay_headers(upstream: &HeaderMap, skip: &[HeaderName]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) || skip.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Relay status, headers and the fully read body.
async fn relay_buffered(
    upstream: reqwest::Response,
    timeout: Duration,
) -> Result<Response, ProxyError> {
    let status = upstream.status();
    let headers = relay_headers(upstream.headers(), &[]);

    let body = upstream.bytes().await.map_err(|e| {
        metrics::record_upstream_error("body");
        error!(error = %e, "failed to read upstream response body");
        if e.is_timeout() {
            ProxyError::UpstreamTimeout(timeout)
        } else {
            ProxyError::UpstreamUnreachable(format!("upstream response read error: {e}"))
        }
    })?;

    let mut builder = Response::builder().status(status);
    if let Some(target) = builder.headers_mut() {
        *target = headers;
    }
    builder
        .body(Body::from(body))
        .map_err(|e| ProxyError::Internal(format!("response build error: {e}")))
}

/// Relay status and headers immediately, then the body one line at a time.
fn relay_stream(upstream: reqwest::Response, guard: InFlightGuard) -> Response {
    let status = upstream.status();
    let mut headers = relay_headers(upstream.headers(), &[header::CONTENT_LENGTH]);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );

    let body = Body::from_stream(relay::line_stream(upstream.bytes_stream(), guard));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
