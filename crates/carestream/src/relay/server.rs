//! HTTP surface for the relay
//!
//! Exposes the reframing relay endpoint, a byte-exact raw passthrough, and
//! the stream-initiation proxy. Each client connection owns its own
//! upstream connection and reframer; the upstream is released on every exit
//! path, including client disconnect.

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::Response,
    routing::{get, post},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::config::Config;
use crate::error::{CarestreamError, Result};

use super::reframe::{DATA_PREFIX, DONE_SENTINEL, EVENT_DELIMITER, EventReframer};
use super::repair::relay_failure_event;
use super::stream_id::{StreamId, StreamIdError};

/// Frames buffered between the relay task and the outbound body. The bound
/// keeps the relay from reading unboundedly ahead of a slow client.
const RELAY_CHANNEL_CAPACITY: usize = 16;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Relay configuration
    pub config: Config,
    /// HTTP client for upstream requests
    pub client: reqwest::Client,
}

/// The main relay server
pub struct RelayServer {
    config: Config,
}

impl RelayServer {
    /// Create a new relay server with the given configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start the relay server and listen for requests
    pub async fn serve(&self) -> Result<()> {
        // Connect timeout only: the stream endpoints hold their responses
        // open far longer than any sane request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.config.upstream.timeout_secs))
            .build()
            .map_err(|e| CarestreamError::Upstream(format!("Failed to create HTTP client: {e}")))?;

        let state = Arc::new(AppState {
            config: self.config.clone(),
            client,
        });

        let app = create_router(state);

        let addr: SocketAddr = self
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| CarestreamError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting relay server on {addr}");
        tracing::info!("Upstream backend: {}", self.config.upstream.base_url);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CarestreamError::Upstream(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| CarestreamError::Upstream(format!("Server error: {e}")))?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/careplan/stream", get(stream_handler))
        .route("/api/careplan/stream/raw", get(raw_stream_handler))
        .route("/api/careplan/initiate-stream", post(initiate_stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - returns JSON status
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(rename = "streamId")]
    stream_id: Option<String>,
}

/// Relay a backend event stream to the client, reframing and repairing
/// events along the way.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response<Body> {
    let stream_id = match validate_stream_id(query.stream_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let upstream = match connect_upstream(&state, &stream_id).await {
        Ok(response) => response,
        Err(response) => return response,
    };

    tracing::debug!("relaying stream {stream_id}");

    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(
        RELAY_CHANNEL_CAPACITY,
    );
    let max_event_bytes = state.config.upstream.max_event_bytes;
    tokio::spawn(run_relay(upstream.bytes_stream().boxed(), tx, max_event_bytes));

    sse_response(Body::from_stream(ReceiverStream::new(rx)))
}

/// Forward the backend stream byte-for-byte, no reframing.
async fn raw_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response<Body> {
    let stream_id = match validate_stream_id(query.stream_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let upstream = match connect_upstream(&state, &stream_id).await {
        Ok(response) => response,
        Err(response) => return response,
    };

    tracing::debug!("passing through stream {stream_id}");

    sse_response(Body::from_stream(upstream.bytes_stream()))
}

/// Forward a stream-initiation request to the backend and return its JSON
/// response (which carries the stream id) verbatim.
async fn initiate_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response<Body> {
    let url = match upstream_endpoint(&state.config.upstream.base_url, "initiate-stream") {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("invalid upstream configuration: {e}");
            return json_error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    tracing::debug!("initiating stream session via {url}");

    let response = match state.client.post(url).json(&payload).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("stream initiation failed: {e}");
            return json_error_response(
                StatusCode::BAD_GATEWAY,
                &format!("Stream initiation error: {e}"),
            );
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response.bytes().await.unwrap_or_default();

    if !status.is_success() {
        let detail = String::from_utf8_lossy(&body);
        tracing::error!("stream initiation error: {status}. {detail}");
        return json_error_response(
            status,
            &format!("Stream initiation error: {status}. {detail}"),
        );
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

/// Validate the `streamId` query parameter.
///
/// A missing or empty parameter is the documented client error; other
/// validation failures surface their own message.
fn validate_stream_id(
    raw: Option<String>,
) -> std::result::Result<StreamId, Response<Body>> {
    let Some(raw) = raw else {
        return Err(missing_stream_id_response());
    };
    match StreamId::try_from(raw) {
        Ok(id) => Ok(id),
        Err(StreamIdError::Empty) => Err(missing_stream_id_response()),
        Err(e) => Err(json_error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    }
}

fn missing_stream_id_response() -> Response<Body> {
    json_error_response(StatusCode::BAD_REQUEST, "Missing streamId parameter")
}

/// Open the upstream event-stream connection for a session.
///
/// Connection failures and non-success statuses are terminal: they come
/// back as an HTTP error response, since no stream has been committed yet.
async fn connect_upstream(
    state: &AppState,
    stream_id: &StreamId,
) -> std::result::Result<reqwest::Response, Response<Body>> {
    let mut url = match upstream_endpoint(&state.config.upstream.base_url, "stream") {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("invalid upstream configuration: {e}");
            return Err(json_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &e.to_string(),
            ));
        }
    };
    url.query_pairs_mut()
        .append_pair("streamId", stream_id.as_str());

    tracing::debug!("connecting to upstream at {url}");

    let response = state
        .client
        .get(url)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| {
            tracing::error!("upstream connection failed: {e}");
            json_error_response(
                StatusCode::BAD_GATEWAY,
                &format!("Stream connection error: {e}"),
            )
        })?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        tracing::error!("upstream returned {status}: {detail}");
        let mirrored =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(json_error_response(
            mirrored,
            &format!("Stream connection error: {status}. {detail}"),
        ));
    }

    Ok(response)
}

/// Drive the upstream chunk stream through the reframer, sending each
/// completed frame downstream.
///
/// The upstream response and reframer live inside this task; dropping the
/// downstream receiver (client disconnect) makes the next send fail, which
/// ends the task and releases the upstream connection. Any mid-stream
/// failure emits one error event plus the completion sentinel, then closes.
async fn run_relay<S, E>(
    mut chunks: S,
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    max_event_bytes: usize,
) where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut reframer = EventReframer::new(max_event_bytes);

    while let Some(next) = chunks.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                fail_stream(&tx, &format!("Stream error: {e}")).await;
                return;
            }
        };

        let outcome = reframer.push(&chunk);

        for frame in outcome.frames {
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                tracing::debug!("client disconnected, releasing upstream stream");
                return;
            }
        }

        if let Some(e) = outcome.error {
            fail_stream(&tx, &e.to_string()).await;
            return;
        }
    }
    // Graceful upstream end: dropping tx closes the downstream body
}

/// Emit the in-band terminal sequence: one error event, then the sentinel.
async fn fail_stream(
    tx: &mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    message: &str,
) {
    tracing::error!("relay failed mid-stream: {message}");
    let error_frame = format!(
        "{DATA_PREFIX} {}{EVENT_DELIMITER}",
        relay_failure_event(message)
    );
    if tx.send(Ok(Bytes::from(error_frame))).await.is_err() {
        return;
    }
    let _ = tx
        .send(Ok(Bytes::from(format!(
            "{DATA_PREFIX} {DONE_SENTINEL}{EVENT_DELIMITER}"
        ))))
        .await;
}

fn upstream_endpoint(base_url: &str, path: &str) -> Result<Url> {
    let joined = format!("{}/{path}", base_url.trim_end_matches('/'));
    Url::parse(&joined)
        .map_err(|e| CarestreamError::Config(format!("Invalid upstream URL '{joined}': {e}")))
}

fn sse_response(body: Body) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

/// Create a JSON error response with body `{"error": message}`
fn json_error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": message });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
