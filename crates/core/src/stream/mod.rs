//! Streaming session manager
//!
//! Multiplexes the accelerator's single callback stream into
//! per-session ring buffers and per-connection chunk delivery. Sessions
//! live in a fixed slot table and are addressed by id (`stream_<request
//! id>`) under the manager lock on every callback; the callback runs on
//! the accelerator worker thread and must never block, so the chunk
//! FIFO is fed with `try_send` and anything the FIFO cannot take is
//! counted as dropped.
//!
//! One session drain task per active stream forwards formatted chunks
//! to the owning connection, withholding delivery while the session is
//! paused (the ring keeps filling; overflow policy then applies) and
//! releasing the slot after the final chunk is handed over.

pub mod ring;

use crate::accel::{CallState, CallbackDecision, TokenEvent};
use crate::config::StreamingConfig;
use crate::conn::ConnectionCtx;
use crate::error::{Error, Result};
use crate::protocol::{self, RequestId};
use parking_lot::Mutex;
use ring::RingBuffer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Session lifecycle states. Transitions only move forward, except that
/// the Idle → Initialising → Streaming prefix may be skipped when the
/// first callback already bears a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Initialising,
    Streaming,
    Paused,
    Finished,
    Error,
    Aborted,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Initialising => "initialising",
            StreamState::Streaming => "streaming",
            StreamState::Paused => "paused",
            StreamState::Finished => "finished",
            StreamState::Error => "error",
            StreamState::Aborted => "aborted",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Finished | StreamState::Error | StreamState::Aborted
        )
    }
}

/// One formatted chunk waiting for transport delivery.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub session_id: String,
    pub request_id: RequestId,
    pub method: String,
    pub seq: u64,
    pub delta: String,
    pub end: bool,
    pub error: Option<String>,
}

impl StreamChunk {
    /// The generic chunk envelope; transports apply their own framing.
    pub fn to_wire(&self) -> String {
        protocol::format_stream_chunk(
            &self.method,
            &self.request_id,
            self.seq,
            &self.delta,
            self.end,
            self.error.as_deref(),
        )
    }
}

struct Session {
    session_id: String,
    request_id: RequestId,
    method: String,
    state: StreamState,
    ring: RingBuffer,
    accumulator: String,
    accumulator_cap: usize,
    chunk_tx: mpsc::Sender<StreamChunk>,
    /// Final chunk the FIFO could not take; the drain task delivers it
    /// out of band so teardown is never lost to backpressure.
    pending_final: Option<StreamChunk>,
    seq: u64,
    total_tokens: u64,
    total_bytes: u64,
    dropped_chunks: u64,
    tokens_per_second: u32,
    started_at: Instant,
    last_token_at: Option<Instant>,
    last_call_state: Option<CallState>,
    last_error: Option<String>,
}

impl Session {
    /// Queue a chunk, assigning its sequence number only on success so
    /// emitted sequences stay contiguous.
    fn push_chunk(&mut self, delta: String, end: bool, error: Option<String>) -> bool {
        let chunk = StreamChunk {
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            method: self.method.clone(),
            seq: self.seq,
            delta,
            end,
            error,
        };
        match self.chunk_tx.try_send(chunk) {
            Ok(()) => {
                self.seq += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(mut chunk)) => {
                if end {
                    chunk.seq = self.seq;
                    self.seq += 1;
                    self.pending_final = Some(chunk);
                    true
                } else {
                    self.dropped_chunks += 1;
                    false
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped_chunks += 1;
                false
            }
        }
    }

    fn stats_json(&self) -> Value {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        let mut stats = json!({
            "session_id": self.session_id,
            "request_id": self.request_id.as_key(),
            "state": self.state.as_str(),
            "total_tokens": self.total_tokens,
            "total_bytes": self.total_bytes,
            "dropped_chunks": self.dropped_chunks,
            "tokens_per_second": self.tokens_per_second,
            "response_length": self.accumulator.len(),
            "elapsed_ms": elapsed_ms,
            "buffer_overflow": self.ring.has_overflowed(),
            "buffer_available": self.ring.available(),
        });
        if let Some(error) = &self.last_error {
            stats["last_error"] = json!(error);
        }
        stats
    }
}

/// Fixed-slot streaming session table.
pub struct StreamManager {
    slots: Mutex<Vec<Option<Session>>>,
    config: StreamingConfig,
}

impl StreamManager {
    pub fn new(config: StreamingConfig) -> Self {
        let mut slots = Vec::with_capacity(config.max_sessions);
        slots.resize_with(config.max_sessions, || None);
        Self {
            slots: Mutex::new(slots),
            config,
        }
    }

    /// Create a session for a streaming request and spawn its drain
    /// task. Enforced here: at most one stream is active at a time, and
    /// a request id maps to at most one session.
    pub fn create_session(
        self: &Arc<Self>,
        request_id: RequestId,
        method: &str,
        conn: ConnectionCtx,
        poll_interval: Duration,
    ) -> Result<String> {
        let session_id = format!("stream_{}", request_id.as_key());
        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_queue_depth);

        {
            let mut slots = self.slots.lock();
            if let Some(active) = slots
                .iter()
                .flatten()
                .find(|s| !s.state.is_terminal())
            {
                return Err(Error::Busy(format!(
                    "stream {} is already active",
                    active.session_id
                )));
            }
            if slots
                .iter()
                .flatten()
                .any(|s| s.session_id == session_id)
            {
                return Err(Error::Busy(format!("session {session_id} already exists")));
            }
            let slot = slots
                .iter_mut()
                .find(|s| s.is_none())
                .ok_or_else(|| Error::Busy("no streaming capacity available".to_string()))?;

            *slot = Some(Session {
                session_id: session_id.clone(),
                request_id,
                method: method.to_string(),
                state: StreamState::Idle,
                ring: RingBuffer::new(self.config.ring_capacity),
                accumulator: String::new(),
                accumulator_cap: self.config.ring_capacity * 2,
                chunk_tx,
                pending_final: None,
                seq: 0,
                total_tokens: 0,
                total_bytes: 0,
                dropped_chunks: 0,
                tokens_per_second: 0,
                started_at: Instant::now(),
                last_token_at: None,
                last_call_state: None,
                last_error: None,
            });
        }

        tracing::info!(session_id = %session_id, transport = conn.transport.as_str(), "streaming session created");
        tokio::spawn(drain_session(
            Arc::clone(self),
            session_id.clone(),
            conn,
            chunk_rx,
            poll_interval,
        ));
        Ok(session_id)
    }

    /// The accelerator callback. Runs on the worker thread, re-acquires
    /// the manager lock per invocation, never blocks.
    pub fn on_token(&self, session_id: &str, event: &TokenEvent<'_>) -> CallbackDecision {
        let mut slots = self.slots.lock();
        let session = match find_mut(&mut slots, session_id) {
            Some(s) => s,
            None => {
                tracing::debug!(session_id, "callback for unknown session, aborting");
                return CallbackDecision::Abort;
            }
        };

        // A torn-down or aborted session rejects the callback; the
        // accelerator treats the non-zero return as an abort request.
        if session.state.is_terminal() {
            return CallbackDecision::Abort;
        }

        session.last_call_state = Some(event.state);
        session.last_token_at = Some(Instant::now());
        let is_final = event.state.is_final();

        // Stage the fragment through the ring; a full ring drops the
        // fragment but lets inference continue so the terminal state
        // still propagates.
        let mut delta = "";
        if !event.text.is_empty() {
            match session.ring.write(event.text.as_bytes()) {
                Ok(()) => {
                    delta = event.text;
                    session.total_tokens += 1;
                    session.total_bytes += event.text.len() as u64;
                    let remaining = session.accumulator_cap - session.accumulator.len().min(session.accumulator_cap);
                    if remaining > 0 {
                        let take = event.text.len().min(remaining);
                        if let Some(slice) = event.text.get(..take) {
                            session.accumulator.push_str(slice);
                        }
                    }
                }
                Err(free) => {
                    session.dropped_chunks += 1;
                    session.last_error =
                        Some("token buffer overflow; fragment dropped".to_string());
                    tracing::warn!(
                        session_id = %session.session_id,
                        fragment_len = event.text.len(),
                        ring_free = free,
                        "ring buffer overflow, dropping fragment"
                    );
                }
            }
        }

        let elapsed_ms = session.started_at.elapsed().as_millis() as u64;
        if elapsed_ms > 0 {
            session.tokens_per_second =
                ((session.total_tokens * 1000) / elapsed_ms) as u32;
        }

        match event.state {
            CallState::Normal => {
                if matches!(session.state, StreamState::Idle | StreamState::Initialising) {
                    session.state = StreamState::Streaming;
                }
            }
            CallState::Waiting => {
                if session.state == StreamState::Idle {
                    session.state = StreamState::Initialising;
                }
            }
            CallState::Finish => {
                session.state = StreamState::Finished;
                tracing::debug!(
                    session_id = %session.session_id,
                    total_tokens = session.total_tokens,
                    "stream finished"
                );
            }
            CallState::Error => {
                session.state = StreamState::Error;
                session.last_error = Some("accelerator reported an inference error".to_string());
            }
        }

        if !delta.is_empty() || is_final {
            let error = if event.state == CallState::Error {
                session.last_error.clone()
            } else {
                None
            };
            let delivered = session.push_chunk(delta.to_string(), is_final, error);
            if !delivered && !delta.is_empty() {
                // the fragment will never deliver; take it back out of
                // the pending-byte window
                session.ring.rollback_write(delta.len());
            }
        }

        CallbackDecision::Continue
    }

    /// Abort a session: terminal state plus one final chunk whose error
    /// names the abort. The next callback for the session returns
    /// non-zero, breaking the FFI loop.
    pub fn abort_session(&self, session_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let session = match find_mut(&mut slots, session_id) {
            Some(s) => s,
            None => return false,
        };
        if session.state.is_terminal() {
            return false;
        }
        session.state = StreamState::Aborted;
        session.last_error = Some("aborted by user request".to_string());
        session.push_chunk(String::new(), true, Some("aborted by user request".to_string()));
        tracing::info!(session_id = %session.session_id, "streaming session aborted");
        true
    }

    /// Abort whichever session is currently active, if any.
    pub fn abort_active(&self) -> Option<String> {
        let session_id = self.active_session_id()?;
        self.abort_session(&session_id).then_some(session_id)
    }

    /// Mark a session failed from outside the callback path (worker
    /// errors, queue timeouts) and emit its final chunk.
    pub fn fail_session(&self, session_id: &str, message: &str) {
        let mut slots = self.slots.lock();
        if let Some(session) = find_mut(&mut slots, session_id) {
            if session.state.is_terminal() {
                return;
            }
            session.state = StreamState::Error;
            session.last_error = Some(message.to_string());
            session.push_chunk(String::new(), true, Some(message.to_string()));
            tracing::warn!(session_id, error = message, "streaming session failed");
        }
    }

    /// Withhold chunk delivery. Only a streaming session can pause; the
    /// accelerator keeps producing and the ring absorbs what it can.
    pub fn pause(&self, session_id: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let session = find_mut(&mut slots, session_id)
            .ok_or_else(|| Error::InvalidParams {
                message: "Invalid parameters".to_string(),
                data: Some(json!({ "field": "session_id", "expected": "active session" })),
            })?;
        match session.state {
            StreamState::Streaming | StreamState::Initialising => {
                session.state = StreamState::Paused;
                tracing::info!(session_id, "stream paused");
                Ok(())
            }
            other => Err(Error::Busy(format!(
                "session is {}, cannot pause",
                other.as_str()
            ))),
        }
    }

    pub fn resume(&self, session_id: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let session = find_mut(&mut slots, session_id)
            .ok_or_else(|| Error::InvalidParams {
                message: "Invalid parameters".to_string(),
                data: Some(json!({ "field": "session_id", "expected": "active session" })),
            })?;
        match session.state {
            StreamState::Paused => {
                session.state = StreamState::Streaming;
                tracing::info!(session_id, "stream resumed");
                Ok(())
            }
            other => Err(Error::Busy(format!(
                "session is {}, cannot resume",
                other.as_str()
            ))),
        }
    }

    /// Statistics for one session.
    pub fn stats(&self, session_id: &str) -> Result<Value> {
        let mut slots = self.slots.lock();
        find_mut(&mut slots, session_id)
            .map(|s| s.stats_json())
            .ok_or_else(|| Error::InvalidParams {
                message: "Invalid parameters".to_string(),
                data: Some(json!({ "field": "session_id", "expected": "active session" })),
            })
    }

    /// Id of the non-terminal session, if one exists.
    pub fn active_session_id(&self) -> Option<String> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|s| !s.state.is_terminal())
            .map(|s| s.session_id.clone())
    }

    /// Current state of a session, while it still occupies a slot.
    pub fn session_state(&self, session_id: &str) -> Option<StreamState> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|s| s.session_id == session_id)
            .map(|s| s.state)
    }

    pub fn active_session_count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    fn is_paused(&self, session_id: &str) -> bool {
        self.session_state(session_id) == Some(StreamState::Paused)
    }

    fn consume_ring(&self, session_id: &str, n: usize) {
        if n == 0 {
            return;
        }
        let mut slots = self.slots.lock();
        if let Some(session) = find_mut(&mut slots, session_id) {
            session.ring.consume(n);
        }
    }

    fn take_pending_final(&self, session_id: &str) -> Option<StreamChunk> {
        let mut slots = self.slots.lock();
        find_mut(&mut slots, session_id).and_then(|s| s.pending_final.take())
    }

    /// Free a slot after its final chunk was handed to the transport.
    fn release(&self, session_id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|sess| sess.session_id == session_id))
        {
            *slot = None;
            tracing::debug!(session_id, "streaming session released");
        }
    }
}

fn find_mut<'a>(slots: &'a mut [Option<Session>], session_id: &str) -> Option<&'a mut Session> {
    slots
        .iter_mut()
        .flatten()
        .find(|s| s.session_id == session_id)
}

/// Per-session drain: forwards chunks to the owning connection in FIFO
/// order, consumes the matching ring bytes, honours pause, and releases
/// the slot after the final chunk.
async fn drain_session(
    manager: Arc<StreamManager>,
    session_id: String,
    conn: ConnectionCtx,
    mut chunk_rx: mpsc::Receiver<StreamChunk>,
    poll_interval: Duration,
) {
    loop {
        let chunk = match chunk_rx.recv().await {
            Some(chunk) => chunk,
            None => break,
        };

        while manager.is_paused(&session_id) {
            tokio::time::sleep(poll_interval).await;
        }

        let delta_len = chunk.delta.len();
        let mut end = chunk.end;
        if !conn.push(chunk.to_wire()) {
            tracing::debug!(session_id = %session_id, "connection closed, chunk discarded");
        }
        manager.consume_ring(&session_id, delta_len);

        if let Some(pending) = manager.take_pending_final(&session_id) {
            let _ = conn.push(pending.to_wire());
            end = true;
        }

        if end {
            manager.release(&session_id);
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "drain task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnectionToken, TransportKind};
    use serde_json::Value as JsonValue;

    fn manager() -> Arc<StreamManager> {
        Arc::new(StreamManager::new(StreamingConfig::default()))
    }

    fn connection() -> (ConnectionCtx, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionCtx::new(TransportKind::WebSocket, ConnectionToken(7), tx),
            rx,
        )
    }

    fn event(text: &str, state: CallState) -> (String, CallState) {
        (text.to_string(), state)
    }

    async fn collect_chunks(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<JsonValue> {
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("chunk timed out")
                .expect("channel closed");
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn chunks_flow_in_order_and_slot_is_released() {
        let manager = manager();
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::Number(4),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();
        assert_eq!(session_id, "stream_4");

        for (text, state) in [
            event("", CallState::Waiting),
            event("Hel", CallState::Normal),
            event("lo", CallState::Normal),
            event("!", CallState::Normal),
            event("", CallState::Finish),
        ] {
            let ev = TokenEvent {
                text: &text,
                token_id: 0,
                state,
            };
            assert_eq!(
                manager.on_token(&session_id, &ev),
                CallbackDecision::Continue
            );
        }

        let chunks = collect_chunks(&mut rx, 4).await;
        let seqs: Vec<u64> = chunks.iter().map(|c| c["params"]["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        let deltas: Vec<&str> = chunks
            .iter()
            .map(|c| c["params"]["delta"].as_str().unwrap())
            .collect();
        assert_eq!(deltas, vec!["Hel", "lo", "!", ""]);
        assert_eq!(chunks[3]["params"]["end"], true);
        assert_eq!(chunks[0]["params"]["request_id"], "4");

        // teardown releases the slot once the final chunk is delivered
        for _ in 0..100 {
            if manager.active_session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.active_session_count(), 0);
    }

    #[tokio::test]
    async fn first_callback_with_finish_skips_intermediate_states() {
        let manager = manager();
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::Number(1),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();
        let ev = TokenEvent {
            text: "",
            token_id: 0,
            state: CallState::Finish,
        };
        manager.on_token(&session_id, &ev);
        let chunks = collect_chunks(&mut rx, 1).await;
        assert_eq!(chunks[0]["params"]["end"], true);
        assert_eq!(chunks[0]["params"]["seq"], 0);
    }

    #[tokio::test]
    async fn second_concurrent_stream_is_rejected() {
        let manager = manager();
        let (conn_a, _rx_a) = connection();
        let (conn_b, _rx_b) = connection();
        manager
            .create_session(
                RequestId::Number(1),
                "run_async",
                conn_a,
                Duration::from_millis(5),
            )
            .unwrap();
        let err = manager
            .create_session(
                RequestId::Number(2),
                "run_async",
                conn_b,
                Duration::from_millis(5),
            )
            .unwrap_err();
        assert_eq!(err.json_rpc_code(), -32007);
    }

    #[tokio::test]
    async fn abort_emits_one_final_chunk_and_rejects_further_callbacks() {
        let manager = manager();
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::Number(6),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();

        let ev = TokenEvent {
            text: "tok ",
            token_id: 1,
            state: CallState::Normal,
        };
        manager.on_token(&session_id, &ev);
        assert!(manager.abort_session(&session_id));
        assert_eq!(
            manager.session_state(&session_id),
            Some(StreamState::Aborted)
        );

        // within one callback of the abort, the FFI is told to stop
        let ev = TokenEvent {
            text: "more",
            token_id: 2,
            state: CallState::Normal,
        };
        assert_eq!(manager.on_token(&session_id, &ev), CallbackDecision::Abort);

        let chunks = collect_chunks(&mut rx, 2).await;
        assert_eq!(chunks[0]["params"]["delta"], "tok ");
        assert_eq!(chunks[1]["params"]["end"], true);
        assert!(chunks[1]["params"]["error"]
            .as_str()
            .unwrap()
            .contains("abort"));
    }

    #[tokio::test]
    async fn pause_withholds_delivery_until_resume() {
        let manager = manager();
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::Number(3),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();

        let ev = TokenEvent {
            text: "a ",
            token_id: 1,
            state: CallState::Normal,
        };
        manager.on_token(&session_id, &ev);
        // let the drain deliver the first chunk before pausing
        let _ = collect_chunks(&mut rx, 1).await;
        manager.pause(&session_id).unwrap();

        let ev = TokenEvent {
            text: "b ",
            token_id: 2,
            state: CallState::Normal,
        };
        manager.on_token(&session_id, &ev);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err(), "paused session must not deliver");

        manager.resume(&session_id).unwrap();
        let chunks = collect_chunks(&mut rx, 1).await;
        assert_eq!(chunks[0]["params"]["delta"], "b ");
    }

    #[tokio::test]
    async fn ring_overflow_drops_fragment_but_keeps_stream_alive() {
        let config = StreamingConfig {
            ring_capacity: 8,
            ..StreamingConfig::default()
        };
        let manager = Arc::new(StreamManager::new(config));
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::Number(9),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();

        // pause delivery before any token so the ring cannot drain
        let ev = TokenEvent {
            text: "",
            token_id: 0,
            state: CallState::Waiting,
        };
        manager.on_token(&session_id, &ev);
        manager.pause(&session_id).unwrap();

        let ev = TokenEvent {
            text: "12345678",
            token_id: 1,
            state: CallState::Normal,
        };
        manager.on_token(&session_id, &ev);

        let ev = TokenEvent {
            text: "overflow",
            token_id: 2,
            state: CallState::Normal,
        };
        assert_eq!(manager.on_token(&session_id, &ev), CallbackDecision::Continue);

        let stats = manager.stats(&session_id).unwrap();
        assert_eq!(stats["dropped_chunks"], 1);
        assert_eq!(stats["buffer_overflow"], true);

        manager.resume(&session_id).unwrap();
        let ev = TokenEvent {
            text: "",
            token_id: 0,
            state: CallState::Finish,
        };
        manager.on_token(&session_id, &ev);
        let chunks = collect_chunks(&mut rx, 2).await;
        assert_eq!(chunks[0]["params"]["delta"], "12345678");
        assert_eq!(chunks[1]["params"]["end"], true);
    }

    #[tokio::test]
    async fn accumulator_matches_emitted_deltas() {
        let manager = manager();
        let (conn, mut rx) = connection();
        let session_id = manager
            .create_session(
                RequestId::String("acc".to_string()),
                "run_async",
                conn,
                Duration::from_millis(5),
            )
            .unwrap();

        let fragments = ["alpha ", "beta ", "gamma"];
        for (i, frag) in fragments.iter().enumerate() {
            let ev = TokenEvent {
                text: frag,
                token_id: i as i32,
                state: CallState::Normal,
            };
            manager.on_token(&session_id, &ev);
        }
        let stats = manager.stats(&session_id).unwrap();
        assert_eq!(
            stats["response_length"].as_u64().unwrap() as usize,
            fragments.concat().len()
        );
        let chunks = collect_chunks(&mut rx, 3).await;
        let concatenated: String = chunks
            .iter()
            .map(|c| c["params"]["delta"].as_str().unwrap())
            .collect();
        assert_eq!(concatenated, fragments.concat());
    }
}
