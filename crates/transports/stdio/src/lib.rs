//! Line-oriented stdio transport
//!
//! One JSON-RPC message per newline-terminated line on stdin; every
//! outbound message (responses, pushed completions, stream chunks)
//! goes to stdout with a mandatory trailing newline. A single writer
//! task serialises stdout so chunk ordering survives interleaved
//! pushes.
//!
//! The loop is generic over its reader and writer so tests drive it
//! through in-memory pipes; `serve` binds it to the process streams.

use inferd_core::{ConnectionCtx, ConnectionToken, Engine};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// Serve JSON-RPC over stdin/stdout until EOF or shutdown.
pub async fn serve(engine: Arc<Engine>, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    serve_io(engine, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// Serve JSON-RPC over an arbitrary line-oriented byte stream pair.
pub async fn serve_io<R, W>(
    engine: Arc<Engine>,
    reader: R,
    writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let (tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let conn = ConnectionCtx::new(
        inferd_core::TransportKind::Stdio,
        ConnectionToken(0),
        tx,
    );

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound_rx.recv().await {
            if writer.write_all(message.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    tracing::info!("stdio transport ready");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("stdio transport shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    None => {
                        tracing::info!("input closed, stdio transport stopping");
                        break;
                    }
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        if let Some(response) = engine.handle_message(line.as_bytes(), &conn) {
                            // responses flow through the same writer as
                            // pushed messages to keep output ordered
                            if !conn.push(response) {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    // the engine may still hold outbound senders (registry entries,
    // active drains); give the writer a moment to flush, then stop it
    drop(conn);
    let mut writer_task = writer_task;
    if tokio::time::timeout(std::time::Duration::from_millis(500), &mut writer_task)
        .await
        .is_err()
    {
        tracing::debug!("stdio writer stopped with messages pending");
        writer_task.abort();
    }
    Ok(())
}
