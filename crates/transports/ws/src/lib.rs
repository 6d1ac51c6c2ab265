//! WebSocket transport
//!
//! One JSON-RPC message per text frame. Each upgraded socket gets its
//! own connection context; responses, pushed completions and stream
//! chunks all flow back as text frames on the same socket. The server
//! pings on the configured keep-alive interval to hold NAT mappings
//! open during long generations.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use inferd_core::config::WsConfig;
use inferd_core::{ConnectionCtx, ConnectionToken, Engine, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct ServerState {
    engine: Arc<Engine>,
    config: WsConfig,
}

/// Build the router for the WebSocket transport.
pub fn router(engine: Arc<Engine>, config: WsConfig) -> Router {
    Router::new()
        .route("/", get(upgrade_handler))
        .with_state(ServerState { engine, config })
}

/// Serve the WebSocket transport until shutdown.
pub async fn serve(
    engine: Arc<Engine>,
    config: WsConfig,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    serve_listener(engine, config, listener, shutdown).await
}

/// Serve over a pre-bound listener.
pub async fn serve_listener(
    engine: Arc<Engine>,
    config: WsConfig,
    listener: tokio::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "websocket transport listening");
    axum::serve(listener, router(engine, config))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            tracing::info!("websocket transport shutting down");
        })
        .await
}

async fn upgrade_handler(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let (tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let token = ConnectionToken(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
    let conn = ConnectionCtx::new(TransportKind::WebSocket, token, tx);
    tracing::debug!(token = token.0, "websocket connection established");

    let mut keep_alive = tokio::time::interval(std::time::Duration::from_millis(
        state.config.keep_alive_interval_ms.max(1),
    ));
    keep_alive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(response) = state.engine.handle_message(text.as_bytes(), &conn) {
                            if socket.send(Message::Text(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // binary and pong frames are ignored
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            pushed = outbound_rx.recv() => {
                match pushed {
                    Some(message) => {
                        if socket.send(Message::Text(message)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keep_alive.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(token = token.0, "websocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use inferd_core::accel::SimAccelerator;
    use inferd_core::Config;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    struct TestServer {
        port: u16,
        handle: tokio::task::JoinHandle<std::io::Result<()>>,
        // keeps the shutdown channel open for the server's lifetime
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn start_server() -> TestServer {
        let engine = Engine::new(Config::default(), Arc::new(SimAccelerator::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(serve_listener(
            engine,
            WsConfig::default(),
            listener,
            shutdown_rx,
        ));
        TestServer {
            port,
            handle,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn next_text(
        ws: &mut (impl futures::Stream<
            Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
    ) -> String {
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
                .await
                .expect("frame timed out")
                .expect("socket closed")
                .expect("socket error");
            if msg.is_text() {
                return msg.into_text().unwrap();
            }
            // pings and pongs are transparent to the protocol
        }
    }

    #[tokio::test]
    async fn round_trip_over_a_real_socket() {
        let server = start_server().await;

        let (mut ws, _response) =
            connect_async(format!("ws://127.0.0.1:{}/", server.port))
                .await
                .unwrap();
        ws.send(ClientMessage::Text(
            r#"{"jsonrpc":"2.0","id":1,"method":"list_functions","params":{}}"#.into(),
        ))
        .await
        .unwrap();

        let text = next_text(&mut ws).await;
        let response: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert!(response["result"]["functions"].is_array());

        server.handle.abort();
    }

    #[tokio::test]
    async fn pushed_completion_arrives_on_the_same_socket() {
        let server = start_server().await;

        let (mut ws, _response) =
            connect_async(format!("ws://127.0.0.1:{}/", server.port))
                .await
                .unwrap();
        ws.send(ClientMessage::Text(
            r#"{"jsonrpc":"2.0","id":2,"method":"init","params":{"model_path":"/tmp/m.bin"}}"#
                .into(),
        ))
        .await
        .unwrap();

        // immediate queued acknowledgement
        let ack: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(ack["id"], 2);
        assert_eq!(ack["result"]["status"], "queued");

        // the worker's completion is pushed on the same text-frame socket
        let completion: serde_json::Value =
            serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(completion["id"], 2);
        assert_eq!(completion["result"]["handle_id"], 1);

        server.handle.abort();
    }
}
