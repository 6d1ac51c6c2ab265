//! Async response registry
//!
//! Correlates queued-task completions with the originating connection.
//! An entry is created immediately before enqueue, completed by the
//! scheduler worker, and removed either by the originating transport
//! polling for its result or by the TTL sweep. The table is a fixed
//! slot array scanned linearly: allocation-free at the cost of lookup
//! time, which is negligible at 100 slots.
//!
//! Adding an entry for an id that already exists overwrites the prior
//! entry in place. That keeps idempotent retries cheap, and the
//! overwrite is logged so a slow consumer losing its result is
//! observable.

use crate::config::RegistryConfig;
use crate::conn::{ConnectionCtx, ConnectionToken, OutboundSender, TransportKind};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Request ids longer than this are rejected at the dispatch layer.
pub const MAX_REQUEST_ID_LEN: usize = 64;

struct Entry {
    request_id: String,
    transport: TransportKind,
    #[allow(dead_code)]
    connection: ConnectionToken,
    outbound: Option<OutboundSender>,
    response_json: Option<String>,
    completed: bool,
    error: bool,
    started_at: Instant,
    completed_at: Option<Instant>,
    expires_at: Instant,
}

/// Result of polling for an async response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The task is still queued or executing.
    Pending { elapsed_ms: u64 },
    /// Terminal result; the entry has been removed.
    Complete {
        response_json: String,
        is_error: bool,
    },
}

struct Inner {
    slots: Vec<Option<Entry>>,
    last_sweep: Instant,
    expired_total: u64,
}

/// Fixed-capacity response table with TTL expiry.
pub struct ResponseRegistry {
    inner: Mutex<Inner>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl ResponseRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let mut slots = Vec::with_capacity(config.capacity);
        slots.resize_with(config.capacity, || None);
        Self {
            inner: Mutex::new(Inner {
                slots,
                last_sweep: Instant::now(),
                expired_total: 0,
            }),
            ttl: Duration::from_secs(config.ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    /// Register a pending async response. Overwrites an existing entry
    /// with the same id; fails when the table is full.
    pub fn add(&self, request_id: &str, conn: &ConnectionCtx) -> Result<()> {
        if request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "request id exceeds {MAX_REQUEST_ID_LEN} bytes"
            )));
        }

        let mut inner = self.inner.lock();
        self.sweep_if_due(&mut inner);

        let entry = Entry {
            request_id: request_id.to_string(),
            transport: conn.transport,
            connection: conn.token,
            outbound: Some(conn.outbound.clone()),
            response_json: None,
            completed: false,
            error: false,
            started_at: Instant::now(),
            completed_at: None,
            expires_at: Instant::now() + self.ttl,
        };

        // Existing id: overwrite in place, atomically under the lock.
        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|e| e.request_id == request_id))
        {
            tracing::debug!(request_id, "overwriting existing registry entry");
            *slot = Some(entry);
            return Ok(());
        }

        match inner.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(entry);
                Ok(())
            }
            None => {
                tracing::warn!(request_id, "response registry full");
                Err(Error::Internal("response registry full".to_string()))
            }
        }
    }

    /// Record a terminal result and push it to the originating
    /// connection when that connection still accepts messages. The
    /// entry stays in the table for the poll path until it expires.
    pub fn complete(&self, request_id: &str, response_json: String, is_error: bool) {
        let mut inner = self.inner.lock();
        self.sweep_if_due(&mut inner);

        let entry = match inner
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.request_id == request_id)
        {
            Some(entry) => entry,
            None => {
                tracing::warn!(request_id, "completion for unknown or expired entry");
                return;
            }
        };

        entry.completed = true;
        entry.error = is_error;
        entry.completed_at = Some(Instant::now());
        entry.response_json = Some(response_json.clone());

        let pushed = entry
            .outbound
            .as_ref()
            .map(|tx| tx.send(response_json).is_ok())
            .unwrap_or(false);
        tracing::debug!(
            request_id,
            transport = entry.transport.as_str(),
            is_error,
            pushed,
            "async response completed"
        );
    }

    /// Poll for a result. A terminal result removes the entry.
    pub fn poll(&self, request_id: &str) -> Option<PollOutcome> {
        let mut inner = self.inner.lock();
        self.sweep_if_due(&mut inner);

        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|e| e.request_id == request_id))?;

        let entry = slot.as_ref()?;
        if entry.completed {
            let entry = slot.take()?;
            Some(PollOutcome::Complete {
                response_json: entry.response_json.unwrap_or_default(),
                is_error: entry.error,
            })
        } else {
            Some(PollOutcome::Pending {
                elapsed_ms: entry.started_at.elapsed().as_millis() as u64,
            })
        }
    }

    /// Drop an entry regardless of state.
    pub fn remove(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|e| e.request_id == request_id))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Walk the table and free entries past their expiry. Invoked by
    /// the periodic sweep task and opportunistically from registry
    /// operations.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        Self::sweep_now(&mut inner);
        inner.last_sweep = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expired_total(&self) -> u64 {
        self.inner.lock().expired_total
    }

    fn sweep_if_due(&self, inner: &mut Inner) {
        if inner.last_sweep.elapsed() >= self.sweep_interval {
            Self::sweep_now(inner);
            inner.last_sweep = Instant::now();
        }
    }

    fn sweep_now(inner: &mut Inner) {
        let now = Instant::now();
        let mut cleaned = 0u64;
        for slot in inner.slots.iter_mut() {
            if slot.as_ref().is_some_and(|e| now > e.expires_at) {
                *slot = None;
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            inner.expired_total += cleaned;
            tracing::debug!(cleaned, "expired registry entries released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry_with(ttl_secs: u64, sweep_secs: u64, capacity: usize) -> ResponseRegistry {
        ResponseRegistry::new(RegistryConfig {
            capacity,
            ttl_secs,
            sweep_interval_secs: sweep_secs,
        })
    }

    fn conn() -> (ConnectionCtx, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionCtx::new(TransportKind::Http, ConnectionToken(1), tx),
            rx,
        )
    }

    #[test]
    fn add_complete_poll_lifecycle() {
        let registry = registry_with(300, 60, 4);
        let (conn, mut rx) = conn();
        registry.add("3", &conn).unwrap();

        assert!(matches!(
            registry.poll("3"),
            Some(PollOutcome::Pending { .. })
        ));

        registry.complete("3", r#"{"id":3,"result":{}}"#.to_string(), false);
        // completion was pushed to the originating connection
        assert_eq!(rx.try_recv().unwrap(), r#"{"id":3,"result":{}}"#);

        match registry.poll("3") {
            Some(PollOutcome::Complete {
                response_json,
                is_error,
            }) => {
                assert!(!is_error);
                assert!(response_json.contains("result"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        // terminal poll removed the entry
        assert!(registry.poll("3").is_none());
    }

    #[test]
    fn duplicate_add_overwrites_atomically() {
        let registry = registry_with(300, 60, 4);
        let (first, _rx1) = conn();
        let (second, mut rx2) = conn();
        registry.add("7", &first).unwrap();
        registry.add("7", &second).unwrap();
        assert_eq!(registry.len(), 1);

        registry.complete("7", "done".to_string(), false);
        // the overwrite rebound the entry to the second connection
        assert_eq!(rx2.try_recv().unwrap(), "done");
    }

    #[test]
    fn full_registry_rejects_add() {
        let registry = registry_with(300, 60, 2);
        let (c, _rx) = conn();
        registry.add("1", &c).unwrap();
        registry.add("2", &c).unwrap();
        let err = registry.add("3", &c).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32603);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn oversized_request_id_is_rejected() {
        let registry = registry_with(300, 60, 2);
        let (c, _rx) = conn();
        let id = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        assert!(registry.add(&id, &c).is_err());
    }

    #[test]
    fn sweep_frees_expired_entries() {
        let registry = registry_with(0, 0, 4);
        let (c, _rx) = conn();
        registry.add("a", &c).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep();
        assert!(registry.is_empty());
        assert_eq!(registry.expired_total(), 1);
    }

    #[test]
    fn completion_for_expired_entry_is_dropped() {
        let registry = registry_with(0, 0, 4);
        let (c, mut rx) = conn();
        registry.add("a", &c).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep();
        registry.complete("a", "late".to_string(), false);
        assert!(rx.try_recv().is_err());
    }
}
