//! HTTP transport with SSE streaming
//!
//! Endpoints:
//! - `POST /rpc`: submit a JSON-RPC request (single or batch)
//! - `GET /rpc/stream/:session_id`: receive stream chunks via
//!   Server-Sent-Events (`event: stream_chunk`, `id:` = sequence)
//! - `GET /rpc/poll/:request_id`: poll the async response registry
//! - `GET /health`: liveness
//!
//! A streaming acknowledgement parks the connection's outbound channel
//! under its session id; the SSE endpoint adopts it and replays chunks
//! in order. Queued completions for plain POSTs stay in the registry
//! for the poll path.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use inferd_core::registry::PollOutcome;
use inferd_core::{ConnectionCtx, ConnectionToken, Engine, TransportKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Shared state across handlers.
#[derive(Clone)]
struct ServerState {
    engine: Arc<Engine>,
    /// Outbound channels parked by streaming acknowledgements, adopted
    /// by the SSE endpoint.
    pending_streams: Arc<Mutex<HashMap<String, mpsc::UnboundedReceiver<String>>>>,
}

/// Build the router for the HTTP transport.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = ServerState {
        engine,
        pending_streams: Arc::new(Mutex::new(HashMap::new())),
    };
    Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/rpc/stream/:session_id", get(stream_handler))
        .route("/rpc/poll/:request_id", get(poll_handler))
        .with_state(state)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

/// Serve the HTTP transport until shutdown.
pub async fn serve(
    engine: Arc<Engine>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "http transport listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("http transport shutting down");
        })
        .await
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn rpc_handler(State(state): State<ServerState>, body: String) -> impl IntoResponse {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let token = ConnectionToken(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
    let conn = ConnectionCtx::new(TransportKind::Http, token, tx);

    let response = state.engine.handle_message(body.as_bytes(), &conn);

    let Some(response) = response else {
        return (StatusCode::NO_CONTENT, String::new()).into_response();
    };

    // A streaming acknowledgement parks the channel for the SSE
    // endpoint; chunks buffer in the channel until it is adopted.
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&response) {
        if parsed["result"]["status"] == "streaming" {
            if let Some(session_id) = parsed["result"]["session_id"].as_str() {
                state
                    .pending_streams
                    .lock()
                    .insert(session_id.to_string(), rx);
                tracing::debug!(session_id, "stream parked for SSE pickup");
            }
        }
    }

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        response,
    )
        .into_response()
}

async fn stream_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, impl IntoResponse> {
    let rx = state.pending_streams.lock().remove(&session_id);
    let Some(mut rx) = rx else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no parked stream for session {session_id}"),
        ));
    };

    let stream = async_stream::stream! {
        // The final chunk and the registry completion arrive on the
        // same channel but from different threads; the stream closes
        // once both have been relayed.
        let mut saw_end = false;
        let mut saw_result = false;
        while let Some(message) = rx.recv().await {
            match serde_json::from_str::<serde_json::Value>(&message) {
                Ok(value) if value.get("method").is_some() => {
                    // generic chunk envelope: id is the sequence number
                    let seq = value["params"]["seq"].as_u64().unwrap_or(0);
                    saw_end |= value["params"]["end"].as_bool().unwrap_or(false);
                    yield Ok(Event::default()
                        .event("stream_chunk")
                        .id(seq.to_string())
                        .data(message));
                }
                Ok(_) => {
                    // registry completion for the originating request
                    saw_result = true;
                    yield Ok(Event::default().event("result").data(message));
                }
                Err(e) => {
                    tracing::error!(error = %e, "non-JSON message on stream channel");
                }
            }
            if saw_end && saw_result {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn poll_handler(
    State(state): State<ServerState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    match state.engine.poll_async(&request_id) {
        Some(PollOutcome::Complete { response_json, .. }) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            response_json,
        )
            .into_response(),
        Some(PollOutcome::Pending { elapsed_ms }) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            serde_json::json!({ "status": "pending", "elapsed_ms": elapsed_ms }).to_string(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "application/json")],
            serde_json::json!({
                "error": { "code": -32603, "message": "Internal error", "data": "no such request id" }
            })
            .to_string(),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferd_core::accel::SimAccelerator;
    use inferd_core::Config;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let engine = Engine::new(Config::default(), Arc::new(SimAccelerator::new()));
        router(engine)
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let response = test_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rpc_post_returns_json_response() {
        let response = test_router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/rpc")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"jsonrpc":"2.0","id":1,"method":"list_functions","params":{}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["id"], 1);
        assert!(parsed["result"]["functions"].is_array());
    }

    #[tokio::test]
    async fn notification_returns_no_content() {
        let response = test_router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/rpc")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"jsonrpc":"2.0","method":"abort","params":{}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn unknown_stream_is_not_found() {
        let response = test_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/rpc/stream/stream_999")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_unknown_request_is_not_found() {
        let response = test_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/rpc/poll/12345")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
