//! UDP datagram transport
//!
//! One JSON-RPC message per datagram, demultiplexed by remote address:
//! every sender gets its own connection context, so pushed completions
//! and stream chunks go back to the address that issued the request
//! rather than whichever sender spoke last. Responses are capped below
//! typical MTU; anything larger is replaced with an error envelope.
//! Optional reliability retries failed sends a bounded number of times.

use inferd_core::config::UdpConfig;
use inferd_core::{ConnectionCtx, ConnectionToken, Engine, TransportKind};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Serve JSON-RPC over a UDP socket until shutdown.
pub async fn serve(
    engine: Arc<Engine>,
    config: UdpConfig,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);
    tracing::info!(port = config.port, "udp transport listening");

    let mut connections: HashMap<SocketAddr, ConnectionCtx> = HashMap::new();
    let mut next_token: u64 = 1;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("udp transport shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp receive failed");
                        continue;
                    }
                };

                let conn = connections.entry(peer).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel::<String>();
                    let token = ConnectionToken(next_token);
                    next_token += 1;
                    tokio::spawn(sender_loop(
                        Arc::clone(&socket),
                        peer,
                        rx,
                        config.clone(),
                    ));
                    tracing::debug!(peer = %peer, "udp sender registered");
                    ConnectionCtx::new(TransportKind::Udp, token, tx)
                });

                if let Some(response) = engine.handle_message(&buf[..len], conn) {
                    conn.push(response);
                }
            }
        }
    }
    Ok(())
}

/// Per-sender writer: applies the datagram size cap and the retry
/// policy, addressing every message to the sender that opened the
/// exchange.
async fn sender_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<String>,
    config: UdpConfig,
) {
    while let Some(message) = rx.recv().await {
        let payload = if message.len() > config.max_datagram_bytes {
            tracing::warn!(
                peer = %peer,
                size = message.len(),
                cap = config.max_datagram_bytes,
                "response exceeds datagram cap, sending error envelope"
            );
            oversize_envelope(&message)
        } else {
            message
        };

        let mut attempt = 0u32;
        loop {
            match socket.send_to(payload.as_bytes(), peer).await {
                Ok(_) => break,
                Err(e) if attempt < config.max_retries => {
                    attempt += 1;
                    tracing::debug!(peer = %peer, attempt, error = %e, "udp send retry");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        config.retry_timeout_ms,
                    ))
                    .await;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "udp send failed, dropping message");
                    break;
                }
            }
        }
    }
    tracing::debug!(peer = %peer, "udp sender stopped");
}

/// Replacement envelope for a response that cannot fit one datagram.
/// The id is recovered from the original message when possible.
fn oversize_envelope(original: &str) -> String {
    let id = serde_json::from_str::<serde_json::Value>(original)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(serde_json::Value::Null);
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32603,
            "message": "Internal error",
            "data": "response exceeds datagram size cap",
        }
    })
    .to_string()
}
