//! Request dispatch
//!
//! The engine façade every transport talks to: parse the envelope,
//! classify the method, and route it: meta methods answered directly,
//! instant operations executed on the calling handler, queued
//! operations acknowledged immediately and completed through the
//! response registry, streaming operations acknowledged with a session
//! id and streamed back as notifications on the same connection.

use crate::accel::{Accelerator, CallbackDecision, TokenEvent};
use crate::classify::{self, OpClass};
use crate::config::Config;
use crate::conn::{ConnectionCtx, TransportKind};
use crate::error::{Error, Result};
use crate::marshal::{meta, params, Operation};
use crate::protocol::{self, Parsed, Request, RequestId};
use crate::registry::{PollOutcome, ResponseRegistry, MAX_REQUEST_ID_LEN};
use crate::scheduler::{EnqueueError, Scheduler, Task, TaskHandler, TaskResult};
use crate::stream::StreamManager;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state the scheduler worker executes against.
struct ExecContext {
    accel: Arc<dyn Accelerator>,
    streams: Arc<StreamManager>,
    registry: Arc<ResponseRegistry>,
    config: Arc<Config>,
}

/// The request-lifecycle engine.
pub struct Engine {
    ctx: Arc<ExecContext>,
    scheduler: Scheduler,
    config: Arc<Config>,
}

impl Engine {
    /// Build the engine and start the accelerator worker.
    pub fn new(config: Config, accel: Arc<dyn Accelerator>) -> Arc<Engine> {
        let config = Arc::new(config);
        let ctx = Arc::new(ExecContext {
            accel,
            streams: Arc::new(StreamManager::new(config.streaming.clone())),
            registry: Arc::new(ResponseRegistry::new(config.registry.clone())),
            config: Arc::clone(&config),
        });
        let scheduler = Scheduler::new(
            config.scheduler.queue_capacity,
            Duration::from_millis(config.scheduler.request_timeout_ms),
        );
        scheduler.start(Arc::clone(&ctx) as Arc<dyn TaskHandler>);
        Arc::new(Engine {
            ctx,
            scheduler,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResponseRegistry> {
        &self.ctx.registry
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.ctx.streams
    }

    /// Poll path for transports that cannot receive pushes.
    pub fn poll_async(&self, request_id: &str) -> Option<PollOutcome> {
        self.ctx.registry.poll(request_id)
    }

    /// Stop the scheduler worker, draining the queue.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Handle one raw inbound message (single request or batch) and
    /// return the immediate reply, if one is due. Must be called from
    /// within a tokio runtime: streaming dispatch spawns the session
    /// drain task.
    pub fn handle_message(&self, raw: &[u8], conn: &ConnectionCtx) -> Option<String> {
        match protocol::parse(raw) {
            Err(err) => {
                let id = protocol::extract_id(raw);
                Some(protocol::format_engine_error(id.as_ref(), &err))
            }
            Ok(Parsed::Single(request)) => self.handle_request(request, conn),
            Ok(Parsed::Batch(items)) => {
                let responses: Vec<String> = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Ok(request) => self.handle_request(request, conn),
                        Err(err) => Some(protocol::format_engine_error(None, &err)),
                    })
                    .collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(format!("[{}]", responses.join(",")))
                }
            }
        }
    }

    fn handle_request(&self, request: Request, conn: &ConnectionCtx) -> Option<String> {
        let Request { id, method, params } = request;
        tracing::debug!(
            method = %method,
            id = ?id,
            transport = conn.transport.as_str(),
            "request received"
        );
        match id {
            None => {
                // Notifications execute but never produce a response.
                // Queued and streaming work needs a correlation id, so
                // only instant methods run.
                if classify::classify(&method) == OpClass::Instant {
                    if let Err(err) = self.execute_instant(&method, &params) {
                        tracing::debug!(method = %method, error = %err, "notification failed");
                    }
                } else {
                    tracing::debug!(method = %method, "dropping id-less non-instant request");
                }
                None
            }
            Some(id) => {
                let outcome = self.dispatch(&id, &method, &params, conn);
                Some(match outcome {
                    Ok(result) => protocol::format_response(&id, result),
                    Err(err) => {
                        tracing::debug!(method = %method, id = %id, error = %err, "request failed");
                        protocol::format_engine_error(Some(&id), &err)
                    }
                })
            }
        }
    }

    fn dispatch(
        &self,
        id: &RequestId,
        method: &str,
        request_params: &Value,
        conn: &ConnectionCtx,
    ) -> Result<Value> {
        match classify::classify(method) {
            OpClass::Instant => self.execute_instant(method, request_params),
            OpClass::AcceleratorQueued => self.enqueue_task(id, method, request_params, conn),
            OpClass::Streaming => self.start_stream(id, method, request_params, conn),
        }
    }

    fn execute_instant(&self, method: &str, request_params: &Value) -> Result<Value> {
        match method {
            "list_functions" => Ok(meta::list_functions()),
            "get_constants" => Ok(meta::get_constants()),
            "queue_status" => Ok(self.queue_status()),
            "abort" => self.abort(),
            "stream_pause" => {
                let session_id = self.target_session(request_params)?;
                self.ctx.streams.pause(&session_id)?;
                Ok(json!({ "status": "ok", "session_id": session_id }))
            }
            "stream_resume" => {
                let session_id = self.target_session(request_params)?;
                self.ctx.streams.resume(&session_id)?;
                Ok(json!({ "status": "ok", "session_id": session_id }))
            }
            "stream_stats" => {
                let session_id = self.target_session(request_params)?;
                self.ctx.streams.stats(&session_id)
            }
            _ => {
                let op = Operation::parse(
                    method,
                    request_params,
                    self.ctx.accel.as_ref(),
                    &self.config.accel,
                )?;
                op.execute(self.ctx.accel.as_ref())
            }
        }
    }

    /// `abort` bypasses the queue: it signals the accelerator directly
    /// and transitions any active stream to Aborted, then returns a
    /// success envelope immediately.
    fn abort(&self) -> Result<Value> {
        if let Err(status) = self.ctx.accel.abort() {
            tracing::warn!(status, "accelerator abort returned an error");
        }
        let aborted_stream = self.ctx.streams.abort_active();
        Ok(match aborted_stream {
            Some(session_id) => json!({ "status": "ok", "aborted_stream": session_id }),
            None => json!({ "status": "ok" }),
        })
    }

    fn queue_status(&self) -> Value {
        let stats = self.scheduler.stats();
        let mut status = json!({
            "busy": stats.busy,
            "pending": stats.pending,
            "accepted": stats.accepted,
            "processed": stats.processed,
            "failed": stats.failed,
            "overflows": stats.overflows,
            "active_streams": self.ctx.streams.active_session_count(),
        });
        if let Some(current) = self.scheduler.current_operation() {
            status["current_operation"] = json!({
                "method": current.method,
                "request_id": current.request_id,
                "elapsed_ms": current.elapsed_ms,
            });
        }
        status
    }

    fn target_session(&self, request_params: &Value) -> Result<String> {
        if let Some(obj) = request_params.as_object() {
            if let Some(explicit) = params::opt_str(obj, "session_id")? {
                return Ok(explicit);
            }
            if let Some(request_id) = obj.get("request_id") {
                let key = match request_id {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => return Err(Error::invalid_param("request_id", "number or string")),
                };
                return Ok(format!("stream_{key}"));
            }
        }
        self.ctx
            .streams
            .active_session_id()
            .ok_or_else(|| Error::Busy("no active streaming session".to_string()))
    }

    fn enqueue_task(
        &self,
        id: &RequestId,
        method: &str,
        request_params: &Value,
        conn: &ConnectionCtx,
    ) -> Result<Value> {
        let key = id.as_key();
        if key.len() > MAX_REQUEST_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "request id exceeds {MAX_REQUEST_ID_LEN} bytes"
            )));
        }
        // Parameter-shape errors surface to the caller immediately; the
        // worker re-parses when the task actually runs.
        Operation::parse(
            method,
            request_params,
            self.ctx.accel.as_ref(),
            &self.config.accel,
        )?;
        self.ctx.registry.add(&key, conn)?;

        let task = Task {
            request_id: id.clone(),
            method: method.to_string(),
            params: request_params.clone(),
            conn: conn.clone(),
            queued_at: Instant::now(),
            class: OpClass::AcceleratorQueued,
        };
        match self.scheduler.enqueue(task) {
            Ok(position) => Ok(json!({
                "status": "queued",
                "queue_position": position,
                "estimated_wait_ms": classify::estimated_wait_ms(method),
            })),
            Err(EnqueueError::Full) => {
                self.ctx.registry.remove(&key);
                Err(Error::Internal("queue full".to_string()))
            }
            Err(EnqueueError::Shutdown) => {
                self.ctx.registry.remove(&key);
                Err(Error::Busy("server shutting down".to_string()))
            }
        }
    }

    fn start_stream(
        &self,
        id: &RequestId,
        method: &str,
        request_params: &Value,
        conn: &ConnectionCtx,
    ) -> Result<Value> {
        if !self.ctx.accel.is_initialised() {
            return Err(Error::NotInitialised);
        }
        let key = id.as_key();
        if key.len() > MAX_REQUEST_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "request id exceeds {MAX_REQUEST_ID_LEN} bytes"
            )));
        }
        Operation::parse(
            method,
            request_params,
            self.ctx.accel.as_ref(),
            &self.config.accel,
        )?;
        self.ctx.registry.add(&key, conn)?;

        let session_id = match self.ctx.streams.create_session(
            id.clone(),
            method,
            conn.clone(),
            self.poll_interval(conn.transport),
        ) {
            Ok(session_id) => session_id,
            Err(err) => {
                self.ctx.registry.remove(&key);
                return Err(err);
            }
        };

        let task = Task {
            request_id: id.clone(),
            method: method.to_string(),
            params: request_params.clone(),
            conn: conn.clone(),
            queued_at: Instant::now(),
            class: OpClass::Streaming,
        };
        match self.scheduler.enqueue(task) {
            Ok(_) => Ok(json!({
                "status": "streaming",
                "session_id": session_id,
            })),
            Err(reason) => {
                self.ctx
                    .streams
                    .fail_session(&session_id, "queue rejected streaming task");
                self.ctx.registry.remove(&key);
                match reason {
                    EnqueueError::Full => Err(Error::Internal("queue full".to_string())),
                    EnqueueError::Shutdown => {
                        Err(Error::Busy("server shutting down".to_string()))
                    }
                }
            }
        }
    }

    /// Chunk-drain poll interval for a transport, from configuration.
    fn poll_interval(&self, transport: TransportKind) -> Duration {
        let transports = &self.config.transports;
        let ms = match transport {
            TransportKind::Udp => transports.udp.poll_interval_ms,
            TransportKind::WebSocket => transports.ws.poll_interval_ms,
            TransportKind::Http => transports.http.poll_interval_ms,
            TransportKind::Stdio | TransportKind::Tcp => 50,
        };
        Duration::from_millis(ms)
    }
}

impl ExecContext {
    fn run_queued(&self, task: &Task) -> Result<Value> {
        let op = Operation::parse(
            &task.method,
            &task.params,
            self.accel.as_ref(),
            &self.config.accel,
        )?;
        op.execute(self.accel.as_ref())
    }

    fn run_streaming(&self, task: &Task) -> Result<Value> {
        let session_id = format!("stream_{}", task.request_id.as_key());
        let op = Operation::parse(
            &task.method,
            &task.params,
            self.accel.as_ref(),
            &self.config.accel,
        );
        let op = match op {
            Ok(op) => op,
            Err(err) => {
                self.streams.fail_session(&session_id, &err.to_string());
                return Err(err);
            }
        };

        // Collect the full response locally for the registry result;
        // the session manager handles wire delivery.
        let mut text = String::new();
        let mut tokens: u64 = 0;
        let streams = Arc::clone(&self.streams);
        let mut sink = |event: &TokenEvent<'_>| {
            if !event.text.is_empty() {
                text.push_str(event.text);
                tokens += 1;
            }
            streams.on_token(&session_id, event)
        };

        match op.execute_streaming(self.accel.as_ref(), &mut sink) {
            Ok(()) => Ok(json!({ "text": text, "tokens": tokens })),
            Err(err) => {
                // The callback may already have sealed the session
                // (abort, inference error); fail_session is a no-op on
                // terminal states.
                self.streams.fail_session(&session_id, &err.to_string());
                Err(err)
            }
        }
    }

    fn complete(&self, task: &Task, outcome: Result<Value>) -> TaskResult {
        let key = task.request_id.as_key();
        match outcome {
            Ok(result) => {
                let response = protocol::format_response(&task.request_id, result);
                self.registry.complete(&key, response, false);
                TaskResult::Completed
            }
            Err(err) => {
                let response = protocol::format_engine_error(Some(&task.request_id), &err);
                self.registry.complete(&key, response, true);
                TaskResult::Failed
            }
        }
    }
}

impl TaskHandler for ExecContext {
    fn run(&self, task: Task) -> TaskResult {
        let outcome = match task.class {
            OpClass::Streaming => self.run_streaming(&task),
            _ => self.run_queued(&task),
        };
        self.complete(&task, outcome)
    }

    fn timed_out(&self, task: Task) {
        let err = Error::Timeout(format!(
            "request waited past {} ms in queue",
            self.config.scheduler.request_timeout_ms
        ));
        if task.class == OpClass::Streaming {
            let session_id = format!("stream_{}", task.request_id.as_key());
            self.streams.fail_session(&session_id, &err.to_string());
        }
        self.complete(&task, Err(err));
    }

    fn cancelled(&self, task: Task) {
        let err = Error::Internal("server shut down before execution".to_string());
        if task.class == OpClass::Streaming {
            let session_id = format!("stream_{}", task.request_id.as_key());
            self.streams.fail_session(&session_id, &err.to_string());
        }
        self.complete(&task, Err(err));
    }
}
