//! Connection context
//!
//! Every transport registers the connections it accepts with the engine
//! as a [`ConnectionCtx`]: the transport's identity, an opaque
//! per-connection token, and an outbound channel of pre-framed JSON
//! messages. Queued completions and stream chunks are pushed through
//! the outbound channel; the transport's writer applies its own framing
//! (newline, length prefix, SSE event, datagram, text frame).

use tokio::sync::mpsc;

/// The five supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Http,
    WebSocket,
    Tcp,
    Udp,
}

impl TransportKind {
    /// Stable index used in logs and registry entries.
    pub fn index(&self) -> usize {
        match self {
            TransportKind::Stdio => 0,
            TransportKind::Http => 1,
            TransportKind::WebSocket => 2,
            TransportKind::Tcp => 3,
            TransportKind::Udp => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::WebSocket => "websocket",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
        }
    }
}

/// Opaque token identifying one connection within its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken(pub u64);

/// Sender half of a connection's outbound message channel.
pub type OutboundSender = mpsc::UnboundedSender<String>;

/// One live connection as the engine sees it.
#[derive(Debug, Clone)]
pub struct ConnectionCtx {
    pub transport: TransportKind,
    pub token: ConnectionToken,
    /// Pre-framed JSON messages destined for this connection. Dropped
    /// receivers simply discard pushes; the engine never blocks on a
    /// dead connection.
    pub outbound: OutboundSender,
}

impl ConnectionCtx {
    pub fn new(transport: TransportKind, token: ConnectionToken, outbound: OutboundSender) -> Self {
        Self {
            transport,
            token,
            outbound,
        }
    }

    /// Push one message; returns false when the connection is gone.
    pub fn push(&self, message: String) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_indices_are_stable() {
        assert_eq!(TransportKind::Stdio.index(), 0);
        assert_eq!(TransportKind::Udp.index(), 4);
        assert_eq!(TransportKind::WebSocket.as_str(), "websocket");
    }

    #[test]
    fn push_reports_dead_connections() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionCtx::new(TransportKind::Tcp, ConnectionToken(1), tx);
        assert!(conn.push("hello".to_string()));
        drop(rx);
        assert!(!conn.push("gone".to_string()));
    }
}
