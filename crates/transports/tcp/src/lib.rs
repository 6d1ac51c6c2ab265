//! Length-prefixed TCP transport
//!
//! Frames are a little-endian unsigned 32-bit byte count followed by
//! exactly that many bytes of JSON. One handler task per accepted
//! connection reads frames and hands them to the engine; a writer task
//! drains the connection's outbound channel, framing each message on
//! the way out.

use bytes::{BufMut, BytesMut};
use inferd_core::{ConnectionCtx, ConnectionToken, Engine, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Frames larger than this are rejected as malformed rather than
/// buffered; no legitimate request approaches it.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Encode one outbound frame.
pub fn encode_frame(payload: &str) -> BytesMut {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload.as_bytes());
    frame
}

/// Accept loop. Runs until shutdown is signalled.
pub async fn serve(
    engine: Arc<Engine>,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve_listener(engine, listener, shutdown).await
}

/// Accept loop over a pre-bound listener.
pub async fn serve_listener(
    engine: Arc<Engine>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "tcp transport listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("tcp transport shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                tracing::debug!(peer = %peer, "tcp connection accepted");
                let engine = Arc::clone(&engine);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(engine, stream, shutdown).await {
                        tracing::debug!(peer = %peer, error = %e, "tcp connection closed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let token = ConnectionToken(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));
    let conn = ConnectionCtx::new(TransportKind::Tcp, token, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = encode_frame(&message);
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let mut len_buf = [0u8; 4];
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            read = reader.read_exact(&mut len_buf) => {
                match read {
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
                    Err(e) => break Err(e),
                    Ok(_) => {}
                }
                let len = u32::from_le_bytes(len_buf);
                if len == 0 || len > MAX_FRAME_BYTES {
                    break Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid frame length {len}"),
                    ));
                }
                let mut payload = vec![0u8; len as usize];
                reader.read_exact(&mut payload).await?;
                if let Some(response) = engine.handle_message(&payload, &conn) {
                    if !conn.push(response) {
                        break Ok(());
                    }
                }
            }
        }
    };

    drop(conn);
    writer_task.abort();
    result
}
