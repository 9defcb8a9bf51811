//! Queue worker: one OS thread draining one queue.
//!
//! The thread drains its queue, then parks on a condvar until
//! [`MqWorker::notify_new_message`] sets the pending flag or the worker leaves
//! `Started`. A notification that arrives mid-drain keeps the flag set, so the
//! loop drains again instead of sleeping past it.

use crate::broker::MessageBroker;
use crate::error::MqError;
use crate::handler::{HandlerContext, HandlerFactory, MessageProcessor};
use crate::metrics::MqMetrics;
use crate::stats::HandlerStatsSnapshot;
use crate::status::{AtomicStatus, WorkerStatus};
use crate::thread::{reclaim_thread, run_guarded, ReclaimOutcome, ReclaimPolicy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Receives `(worker id, error)` when a worker's drain fails.
///
/// Runs on the failing worker's own thread, after the worker has stopped.
pub type WorkerErrorHandler = Arc<dyn Fn(u64, MqError) + Send + Sync>;

struct WorkerShared {
    id: u64,
    queue_name: String,
    broker: Arc<dyn MessageBroker>,
    processor: Box<dyn MessageProcessor>,
    status: AtomicStatus,
    pending: Mutex<bool>,
    signal: Condvar,
    notifications: AtomicU64,
    times_started: AtomicU64,
    last_error: Mutex<Option<String>>,
    error_handler: Option<WorkerErrorHandler>,
    metrics: MqMetrics,
}

impl WorkerShared {
    fn wake(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = true;
        }
        self.signal.notify_all();
    }

    /// Park until there is work or the worker leaves `Started`.
    ///
    /// Returns `false` if the loop should exit.
    fn wait_for_work(&self) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        while !*pending && self.status.is(WorkerStatus::Started) {
            pending = match self.signal.wait(pending) {
                Ok(guard) => guard,
                Err(_) => return false,
            };
        }
        self.status.is(WorkerStatus::Started)
    }

    fn clear_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = false;
        }
    }

    fn drain(&self) -> Result<usize, MqError> {
        let keep_running = || self.status.is(WorkerStatus::Started);
        run_guarded(|| {
            self.processor
                .process_queue(self.broker.as_ref(), &self.queue_name, &keep_running)
        })
        .unwrap_or_else(|panic| Err(MqError::WorkerPanicked(panic)))
    }

    fn run_loop(self: Arc<Self>) {
        if !self
            .status
            .try_transition(WorkerStatus::Starting, WorkerStatus::Started)
        {
            debug!(queue = %self.queue_name, status = %self.status.load(), "Worker start aborted");
            return;
        }
        self.times_started.fetch_add(1, Ordering::SeqCst);
        info!(queue = %self.queue_name, worker_id = self.id, "Worker started");

        loop {
            self.clear_pending();

            match self.drain() {
                Ok(processed) if processed > 0 => {
                    debug!(queue = %self.queue_name, processed, "Drained queue");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        queue = %self.queue_name,
                        worker_id = self.id,
                        error = %e,
                        "Worker failed while draining queue"
                    );
                    if let Ok(mut last) = self.last_error.lock() {
                        *last = Some(e.to_string());
                    }
                    self.status
                        .try_transition(WorkerStatus::Started, WorkerStatus::Stopping);
                    if let Some(handler) = &self.error_handler {
                        handler(self.id, e);
                    }
                    break;
                }
            }

            if !self.wait_for_work() {
                break;
            }
        }

        if self
            .status
            .try_transition(WorkerStatus::Stopping, WorkerStatus::Stopped)
        {
            info!(queue = %self.queue_name, worker_id = self.id, "Worker stopped");
        }
    }
}

/// A worker bound to one queue and one handler instance
pub struct MqWorker {
    shared: Arc<WorkerShared>,
    factory: HandlerFactory,
    context: HandlerContext,
    reclaim: ReclaimPolicy,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MqWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        factory: HandlerFactory,
        context: HandlerContext,
        error_handler: Option<WorkerErrorHandler>,
        reclaim: ReclaimPolicy,
    ) -> Self {
        let processor = factory(&context);
        let metrics = MqMetrics::new(context.queue.clone(), processor.type_name().to_string());

        Self {
            shared: Arc::new(WorkerShared {
                id: NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst),
                queue_name: context.queue.clone(),
                broker,
                processor,
                status: AtomicStatus::new(WorkerStatus::Stopped),
                pending: Mutex::new(false),
                signal: Condvar::new(),
                notifications: AtomicU64::new(0),
                times_started: AtomicU64::new(0),
                last_error: Mutex::new(None),
                error_handler,
                metrics,
            }),
            factory,
            context,
            reclaim,
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.queue_name
    }

    pub fn type_name(&self) -> &str {
        self.shared.processor.type_name()
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.load()
    }

    pub fn times_started(&self) -> u64 {
        self.shared.times_started.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Whether the worker owns a thread that has not exited yet
    pub fn is_thread_alive(&self) -> bool {
        self.thread
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Wake the worker because its queue received a message
    pub fn notify_new_message(&self) {
        self.shared.notifications.fetch_add(1, Ordering::SeqCst);
        self.shared.metrics.notification();

        if self.shared.status.is(WorkerStatus::Started) {
            self.shared.wake();
        }
    }

    pub fn start(&self) -> Result<(), MqError> {
        match self.status() {
            WorkerStatus::Disposed => return Err(MqError::Disposed("start")),
            WorkerStatus::Started | WorkerStatus::Starting => return Ok(()),
            WorkerStatus::Stopping => {
                // previous thread has not exited yet
                self.reclaim_thread();
                self.shared.status.reset_to_stopped();
            }
            WorkerStatus::Stopped => {}
        }

        if !self
            .shared
            .status
            .try_transition(WorkerStatus::Stopped, WorkerStatus::Starting)
        {
            return Ok(());
        }

        self.reclaim_thread();

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("mq-worker-{}", self.shared.id))
            .spawn(move || shared.run_loop());

        match spawned {
            Ok(handle) => {
                *self.thread.lock()? = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared
                    .status
                    .try_transition(WorkerStatus::Starting, WorkerStatus::Stopped);
                Err(MqError::Internal(format!("failed to spawn worker thread: {}", e)))
            }
        }
    }

    /// Ask the worker to stop; returns without waiting for the thread
    pub fn stop(&self) {
        let status = &self.shared.status;
        if status.try_transition(WorkerStatus::Started, WorkerStatus::Stopping)
            || status.try_transition(WorkerStatus::Starting, WorkerStatus::Stopped)
        {
            debug!(queue = %self.shared.queue_name, "Stopping worker");
        }
        self.shared.wake();
    }

    /// Reclaim the thread (grace, interrupt, leak) and start a fresh one
    pub fn force_restart(&self) -> Result<(), MqError> {
        if self.status() == WorkerStatus::Disposed {
            return Err(MqError::Disposed("restart"));
        }

        warn!(queue = %self.shared.queue_name, "Force restarting worker");
        self.stop();
        self.reclaim_thread();
        self.shared.status.reset_to_stopped();
        self.shared.metrics.worker_restarted();
        self.start()
    }

    /// Stop, reclaim the thread and enter the terminal `Disposed` state
    pub fn dispose(&self) {
        self.stop();
        if !self.shared.status.dispose() {
            return;
        }
        self.shared.wake();
        self.reclaim_thread();
        debug!(queue = %self.shared.queue_name, "Worker disposed");
    }

    /// A fresh, stopped worker bound to the same queue and handler type
    pub fn clone_worker(&self) -> MqWorker {
        MqWorker::new(
            Arc::clone(&self.shared.broker),
            Arc::clone(&self.factory),
            self.context.clone(),
            self.shared.error_handler.clone(),
            self.reclaim,
        )
    }

    pub fn stats(&self) -> HandlerStatsSnapshot {
        let mut stats = self.shared.processor.stats();
        stats.total_notifications = self.shared.notifications.load(Ordering::SeqCst);
        stats
    }

    /// One-line status: queue, state and last processed time
    pub fn status_line(&self) -> String {
        let last = self
            .shared
            .processor
            .stats()
            .last_message_processed
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "{} [{}]: {}, last processed {}",
            self.shared.queue_name,
            self.shared.id,
            self.status(),
            last
        )
    }

    fn reclaim_thread(&self) -> Option<ReclaimOutcome> {
        let handle = self.thread.lock().ok().and_then(|mut t| t.take())?;
        let shared = Arc::clone(&self.shared);
        let outcome = reclaim_thread(handle, self.reclaim, move || shared.wake());
        if outcome == ReclaimOutcome::Leaked {
            warn!(queue = %self.shared.queue_name, worker_id = self.shared.id, "Worker thread leaked");
        }
        Some(outcome)
    }
}

impl Drop for MqWorker {
    fn drop(&mut self) {
        // the thread holds its own Arc; make sure it winds down
        self.stop();
    }
}
