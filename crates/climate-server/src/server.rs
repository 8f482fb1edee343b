//! Routes and handlers: `/healthz`, `/rpc`, `/events`, `/metrics`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{Extensions, Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use climate_codex::{SessionManager, SessionSnapshot};
use climate_events::Event as HubEvent;
use futures::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::error::{error_response, manager_error_response, rpc_error_response};
use crate::identity::IdentityProvider;
use crate::metrics::{
    EVENT_STREAMS_ACTIVE, EVENT_STREAMS_TOTAL, RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL,
};

/// Largest accepted `/rpc` body.
pub const MAX_RPC_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Event name of the first frame on every stream.
pub const SNAPSHOT_EVENT: &str = "session/snapshot";

/// Comment-ping interval on idle streams.
const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Session manager shared across listeners.
    pub manager: Arc<SessionManager>,
    /// Per-listener identity provider.
    pub identity: Arc<dyn IdentityProvider>,
    /// Prometheus render handle for `/metrics`.
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// Build the bridge router.
///
/// Listeners differ only in the identity provider inside `state`; everything
/// else is shared.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/rpc", post(rpc_handler))
        .route("/events", get(events_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_RPC_BODY_BYTES))
        .layer(CatchPanicLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        )
}

/// GET /healthz
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// POST /rpc — one JSON-RPC envelope in, one envelope (or error body) out.
async fn rpc_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let client_key = match state
        .identity
        .client_key(remote_addr(&parts.extensions), &parts.headers)
        .await
    {
        Ok(key) => key,
        Err(err) => {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
        }
    };

    let body = match axum::body::to_bytes(body, MAX_RPC_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "bad_request", "failed to read body")
        }
    };
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "empty body");
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "bad_request", "invalid json"),
    };
    if !payload.is_object() {
        return error_response(StatusCode::BAD_REQUEST, "bad_request", "invalid json");
    }

    if let Some(method) = payload.get("method").and_then(Value::as_str) {
        let id = payload
            .get("id")
            .map_or_else(|| "-".to_owned(), |id| id.to_string());
        info!(client = %client_key, method, id = %id, "rpc");
    }
    metrics::counter!(RPC_REQUESTS_TOTAL).increment(1);

    let session = match state.manager.ensure(&client_key).await {
        Ok(session) => session,
        Err(err) => {
            metrics::counter!(RPC_ERRORS_TOTAL).increment(1);
            return manager_error_response(&err);
        }
    };

    match session.send_rpc(payload, None).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            bytes,
        )
            .into_response(),
        Err(err) => {
            metrics::counter!(RPC_ERRORS_TOTAL).increment(1);
            rpc_error_response(&err)
        }
    }
}

/// GET /events — resumable SSE stream of the client's hub.
///
/// Never ensures a session: subscribing to a dormant client must not cost a
/// child process.
async fn events_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();

    let client_key = match state
        .identity
        .client_key(remote_addr(&parts.extensions), &parts.headers)
        .await
    {
        Ok(key) => key,
        Err(err) => {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
        }
    };

    let last_event_id = parse_last_event_id(&parts.headers);
    let hub = state.manager.events(&client_key);
    let (rx, subscription) = hub.subscribe_from(last_event_id);
    let snapshot = state.manager.snapshot(&client_key).await;

    info!(client = %client_key, from = last_event_id, "events stream connected");
    metrics::counter!(EVENT_STREAMS_TOTAL).increment(1);
    metrics::gauge!(EVENT_STREAMS_ACTIVE).increment(1.0);

    let stream = event_stream(client_key, snapshot, rx, subscription);
    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(SSE_KEEPALIVE_INTERVAL)
                .text("ping"),
        )
        .into_response();

    let headers = response.headers_mut();
    let _ = headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Hint for proxies that would otherwise buffer the stream.
    let _ = headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Stream body: snapshot first, then hub events until the subscriber closes
/// or the request is torn down. Dropping the stream drops the subscription,
/// which removes the queue from the hub.
fn event_stream(
    client_key: String,
    snapshot: SessionSnapshot,
    mut rx: mpsc::Receiver<HubEvent>,
    subscription: climate_events::Subscription,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        let _subscription = subscription;
        let _guard = StreamGuard { client: client_key };

        yield Ok(snapshot_event(&snapshot));
        while let Some(event) = rx.recv().await {
            yield Ok(sse_event(&event));
        }
    }
}

struct StreamGuard {
    client: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::gauge!(EVENT_STREAMS_ACTIVE).decrement(1.0);
        info!(client = %self.client, "events stream disconnected");
    }
}

fn snapshot_event(snapshot: &SessionSnapshot) -> SseEvent {
    match SseEvent::default().event(SNAPSHOT_EVENT).json_data(snapshot) {
        Ok(event) => event,
        Err(err) => SseEvent::default()
            .event(SNAPSHOT_EVENT)
            .data(format!(r#"{{"error":"{}"}}"#, escape_json(&err.to_string()))),
    }
}

/// Convert a hub event to SSE framing: `id:` only when non-zero, `event:`
/// only when non-empty, payload split per line by the SSE writer.
fn sse_event(event: &HubEvent) -> SseEvent {
    let mut out = SseEvent::default();
    if event.id != 0 {
        out = out.id(event.id.to_string());
    }
    if !event.kind.trim().is_empty() {
        out = out.event(event.kind.clone());
    }
    out.data(normalize_data(&event.data))
}

/// CRLF-normalize and drop stray carriage returns; the SSE writer emits one
/// `data:` line per LF-separated line.
fn normalize_data(data: &str) -> String {
    data.replace("\r\n", "\n").replace('\r', "")
}

fn escape_json(message: &str) -> String {
    let quoted = serde_json::to_string(message).unwrap_or_default();
    quoted.trim_matches('"').to_owned()
}

fn parse_last_event_id(headers: &axum::http::HeaderMap) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn remote_addr(extensions: &Extensions) -> SocketAddr {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)))
}
