//! Single-worker accelerator scheduler
//!
//! The accelerator is single-tenant, so every queued operation funnels
//! through one bounded FIFO serviced by exactly one worker thread. The
//! queue fails fast when full, expires tasks that waited past the
//! request timeout without ever touching the accelerator, and keeps the
//! busy/current-operation bookkeeping consistent under one lock.

use crate::classify::OpClass;
use crate::conn::ConnectionCtx;
use crate::protocol::RequestId;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One queued accelerator task. Owned by the queue while enqueued,
/// transferred to the worker on dequeue.
#[derive(Debug, Clone)]
pub struct Task {
    pub request_id: RequestId,
    pub method: String,
    pub params: Value,
    pub conn: ConnectionCtx,
    pub queued_at: Instant,
    pub class: OpClass,
}

/// What the worker reports back per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Completed,
    Failed,
}

/// Executes dequeued tasks. Implemented by the dispatch layer; the
/// scheduler itself knows nothing about marshalling or registries.
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one task to completion (including response delivery).
    fn run(&self, task: Task) -> TaskResult;

    /// The task waited past the request timeout; emit a timeout
    /// response without touching the accelerator.
    fn timed_out(&self, task: Task);

    /// The scheduler is shutting down and the task will never run.
    fn cancelled(&self, task: Task);
}

/// Why an enqueue was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue is at capacity; the queue length did not change.
    Full,
    /// The scheduler is shutting down.
    Shutdown,
}

/// The operation currently holding the accelerator.
#[derive(Debug, Clone)]
pub struct CurrentOp {
    pub method: String,
    pub request_id: String,
    pub elapsed_ms: u64,
}

/// Counters exposed via `queue_status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub accepted: u64,
    pub processed: u64,
    pub failed: u64,
    pub overflows: u64,
    pub pending: usize,
    pub busy: bool,
}

struct QueueState {
    queue: VecDeque<Task>,
    shutdown: bool,
    busy: Option<(String, String, Instant)>,
    accepted: u64,
    processed: u64,
    failed: u64,
    overflows: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    task_ready: Condvar,
    capacity: usize,
    request_timeout: Duration,
}

/// Bounded task queue plus its single worker thread.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(capacity: usize, request_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::with_capacity(capacity),
                    shutdown: false,
                    busy: None,
                    accepted: 0,
                    processed: 0,
                    failed: 0,
                    overflows: 0,
                }),
                task_ready: Condvar::new(),
                capacity,
                request_timeout,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread. Called once at engine construction.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("accel-worker".to_string())
            .spawn(move || worker_loop(shared, handler))
            .expect("failed to spawn accelerator worker thread");
        *self.worker.lock() = Some(handle);
        tracing::info!(capacity = self.shared.capacity, "accelerator scheduler started");
    }

    /// Enqueue a task. Returns the task's queue position (1-based)
    /// on success.
    pub fn enqueue(&self, task: Task) -> Result<usize, EnqueueError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(EnqueueError::Shutdown);
        }
        if state.queue.len() >= self.shared.capacity {
            state.overflows += 1;
            tracing::warn!(
                method = %task.method,
                request_id = %task.request_id,
                capacity = self.shared.capacity,
                "queue full, rejecting task"
            );
            return Err(EnqueueError::Full);
        }
        tracing::debug!(
            method = %task.method,
            request_id = %task.request_id,
            queue_len = state.queue.len() + 1,
            "task enqueued"
        );
        state.queue.push_back(task);
        state.accepted += 1;
        let position = state.queue.len();
        drop(state);
        self.shared.task_ready.notify_one();
        Ok(position)
    }

    /// Whether a task is currently executing in the accelerator.
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().busy.is_some()
    }

    /// Tasks waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// The operation currently holding the accelerator, if any.
    /// Consistent with `is_busy`: busy implies Some, idle implies None.
    pub fn current_operation(&self) -> Option<CurrentOp> {
        let state = self.shared.state.lock();
        state.busy.as_ref().map(|(method, request_id, started)| CurrentOp {
            method: method.clone(),
            request_id: request_id.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            accepted: state.accepted,
            processed: state.processed,
            failed: state.failed,
            overflows: state.overflows,
            pending: state.queue.len(),
            busy: state.busy.is_some(),
        }
    }

    /// Flip the shutdown flag, wake the worker, join it. The worker
    /// finishes any in-flight task first (the accelerator ABI has no
    /// preemption), then drains the queue through `cancelled`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.task_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("accelerator worker panicked during shutdown");
            }
        }
        tracing::info!("accelerator scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, handler: Arc<dyn TaskHandler>) {
    tracing::debug!("accelerator worker started");
    loop {
        let task = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                shared.task_ready.wait(&mut state);
            }
            if state.shutdown {
                // Drain: accepted tasks are never silently dropped.
                let remaining: Vec<Task> = state.queue.drain(..).collect();
                state.failed += remaining.len() as u64;
                drop(state);
                for task in remaining {
                    handler.cancelled(task);
                }
                break;
            }
            let task = match state.queue.pop_front() {
                Some(task) => task,
                None => continue,
            };
            state.busy = Some((
                task.method.clone(),
                task.request_id.as_key(),
                Instant::now(),
            ));
            task
        };

        let waited = task.queued_at.elapsed();
        if waited > shared.request_timeout {
            tracing::warn!(
                method = %task.method,
                request_id = %task.request_id,
                waited_ms = waited.as_millis() as u64,
                "task expired in queue"
            );
            handler.timed_out(task);
            let mut state = shared.state.lock();
            state.failed += 1;
            state.busy = None;
            continue;
        }

        tracing::debug!(method = %task.method, request_id = %task.request_id, "task starting");
        let started = Instant::now();
        let result = handler.run(task);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut state = shared.state.lock();
        match result {
            TaskResult::Completed => state.processed += 1,
            TaskResult::Failed => state.failed += 1,
        }
        state.busy = None;
        drop(state);
        tracing::debug!(elapsed_ms, result = ?result, "task finished");
    }
    tracing::debug!("accelerator worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnectionToken, TransportKind};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_task(id: i64) -> Task {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        // keep the receiver alive long enough for the test body
        std::mem::forget(_rx);
        Task {
            request_id: RequestId::Number(id),
            method: "run".to_string(),
            params: Value::Null,
            conn: ConnectionCtx::new(TransportKind::Tcp, ConnectionToken(1), tx),
            queued_at: Instant::now(),
            class: OpClass::AcceleratorQueued,
        }
    }

    struct RecordingHandler {
        ran: AtomicU64,
        timed_out: AtomicU64,
        cancelled: AtomicU64,
        concurrent: AtomicU64,
        max_concurrent: AtomicU64,
        block: PlMutex<()>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                ran: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                concurrent: AtomicU64::new(0),
                max_concurrent: AtomicU64::new(0),
                block: PlMutex::new(()),
            }
        }
    }

    impl TaskHandler for RecordingHandler {
        fn run(&self, _task: Task) -> TaskResult {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let _guard = self.block.lock();
            std::thread::sleep(Duration::from_millis(5));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.ran.fetch_add(1, Ordering::SeqCst);
            TaskResult::Completed
        }

        fn timed_out(&self, _task: Task) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }

        fn cancelled(&self, _task: Task) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tasks_run_one_at_a_time() {
        let scheduler = Scheduler::new(10, Duration::from_secs(30));
        let handler = Arc::new(RecordingHandler::new());
        scheduler.start(handler.clone());

        for i in 0..5 {
            scheduler.enqueue(test_task(i)).unwrap();
        }
        // wait for the queue to drain
        for _ in 0..200 {
            if handler.ran.load(Ordering::SeqCst) == 5 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handler.ran.load(Ordering::SeqCst), 5);
        assert_eq!(handler.max_concurrent.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
        scheduler.shutdown();
    }

    #[test]
    fn full_queue_rejects_without_growing() {
        let scheduler = Scheduler::new(2, Duration::from_secs(30));
        // no worker started: the queue just fills
        scheduler.enqueue(test_task(1)).unwrap();
        scheduler.enqueue(test_task(2)).unwrap();
        assert_eq!(scheduler.enqueue(test_task(3)), Err(EnqueueError::Full));
        assert_eq!(scheduler.pending_count(), 2);
        assert_eq!(scheduler.stats().overflows, 1);
    }

    #[test]
    fn queue_position_is_reported() {
        let scheduler = Scheduler::new(10, Duration::from_secs(30));
        assert_eq!(scheduler.enqueue(test_task(1)).unwrap(), 1);
        assert_eq!(scheduler.enqueue(test_task(2)).unwrap(), 2);
    }

    #[test]
    fn expired_tasks_never_reach_the_handler_run_path() {
        let scheduler = Scheduler::new(10, Duration::from_millis(1));
        let handler = Arc::new(RecordingHandler::new());

        let mut task = test_task(1);
        task.queued_at = Instant::now() - Duration::from_secs(1);
        scheduler.enqueue(task).unwrap();
        scheduler.start(handler.clone());

        for _ in 0..100 {
            if handler.timed_out.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handler.timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(handler.ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().failed, 1);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let scheduler = Scheduler::new(10, Duration::from_secs(30));
        let handler = Arc::new(RecordingHandler::new());
        // hold the handler's lock so the first task blocks the worker
        let guard = handler.block.lock();
        scheduler.start(handler.clone());
        for i in 0..4 {
            scheduler.enqueue(test_task(i)).unwrap();
        }
        // let the worker pick up the first task
        std::thread::sleep(Duration::from_millis(20));
        let shutdown_thread = {
            let handler = handler.clone();
            std::thread::spawn(move || {
                // release the worker shortly after shutdown is requested
                std::thread::sleep(Duration::from_millis(20));
                let _ = handler;
            })
        };
        drop(guard);
        scheduler.shutdown();
        shutdown_thread.join().unwrap();

        let ran = handler.ran.load(Ordering::SeqCst);
        let cancelled = handler.cancelled.load(Ordering::SeqCst);
        assert_eq!(ran + cancelled, 4, "no task is silently dropped");
    }

    #[test]
    fn busy_and_current_operation_agree() {
        let scheduler = Scheduler::new(10, Duration::from_secs(30));
        assert!(!scheduler.is_busy());
        assert!(scheduler.current_operation().is_none());

        let handler = Arc::new(RecordingHandler::new());
        let guard = handler.block.lock();
        scheduler.start(handler.clone());
        scheduler.enqueue(test_task(9)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(scheduler.is_busy());
        let current = scheduler.current_operation().unwrap();
        assert_eq!(current.method, "run");
        assert_eq!(current.request_id, "9");
        drop(guard);
        scheduler.shutdown();
        assert!(!scheduler.is_busy());
        assert!(scheduler.current_operation().is_none());
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let scheduler = Scheduler::new(10, Duration::from_secs(30));
        let handler = Arc::new(RecordingHandler::new());
        scheduler.start(handler);
        scheduler.shutdown();
        assert_eq!(scheduler.enqueue(test_task(1)), Err(EnqueueError::Shutdown));
    }
}
