//! MQ server: owns the workers and the control thread.
//!
//! Lifecycle is a CAS state machine (`Stopped → Starting → Started →
//! Stopping → Stopped`, terminal `Disposed`). Concurrent callers race on
//! [`AtomicStatus::try_transition`]; only the winner does the work.
//!
//! The control thread blocks in the broker subscription on the control topic.
//! A queue-name payload wakes every worker bound to that queue. The `CTRL`
//! sentinel makes the loop consume the pending operation (stop, reset or
//! restart workers). Broker errors stop the server and, when keep-alive is
//! configured, the same thread sleeps with backoff and starts it again.

use crate::backoff::backoff_delay_capped;
use crate::broker::{MessageBroker, SubscriptionControl, SubscriptionEvent};
use crate::client::MqClient;
use crate::config::MqServerConfig;
use crate::control::ControlMessage;
use crate::error::{HandlerError, MqError};
use crate::handler::{ErrorCallback, HandlerContext, HandlerRegistry};
use crate::message::{Message, MqMessage};
use crate::metrics;
use crate::queue_names::QueueNames;
use crate::stats::HandlerStatsSnapshot;
use crate::status::{AtomicStatus, PendingOperation, WorkerOperation, WorkerStatus};
use crate::thread::{reclaim_thread, ReclaimOutcome};
use crate::worker::{MqWorker, WorkerErrorHandler};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Callback for control-loop failures
pub type ServerErrorCallback = Arc<dyn Fn(&MqError) + Send + Sync>;

struct ServerShared {
    broker: Arc<dyn MessageBroker>,
    config: MqServerConfig,
    registry: Mutex<HandlerRegistry>,
    workers: RwLock<Vec<Arc<MqWorker>>>,
    queue_workers: RwLock<HashMap<String, Vec<usize>>>,
    initialized: AtomicBool,
    status: AtomicStatus,
    pending: PendingOperation,
    control_thread: Mutex<Option<JoinHandle<()>>>,
    control_threads_spawned: AtomicU64,
    subscribed: AtomicBool,
    times_started: AtomicU64,
    no_of_errors: AtomicU64,
    no_of_continuous_errors: AtomicU32,
    last_error: Mutex<Option<String>>,
    error_callback: RwLock<Option<ServerErrorCallback>>,
    retry_lock: Mutex<()>,
    retry_signal: Condvar,
}

impl ServerShared {
    fn workers_snapshot(&self) -> Vec<Arc<MqWorker>> {
        self.workers.read().map(|w| w.clone()).unwrap_or_default()
    }

    fn is_control_thread(&self) -> bool {
        self.control_thread
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|h| h.thread().id()))
            .is_some_and(|id| id == thread::current().id())
    }

    fn send_command(&self) -> Result<(), MqError> {
        self.broker.notify(
            &self.config.control_topic,
            &ControlMessage::encode_command(None),
        )
    }

    fn start_workers(&self) {
        let workers = self.workers_snapshot();
        debug!(count = workers.len(), "Starting worker threads");
        for worker in &workers {
            if let Err(e) = worker.start() {
                warn!(queue = %worker.queue_name(), error = %e, "Could not start worker");
                self.report_error(&e);
            }
        }
        metrics::workers_running(workers.len());
    }

    fn stop_workers(&self) {
        debug!("Stopping worker threads");
        for worker in self.workers_snapshot() {
            worker.stop();
        }
        metrics::workers_running(0);
    }

    fn notify_workers(&self, queue: &str) {
        let indices = self
            .queue_workers
            .read()
            .ok()
            .and_then(|map| map.get(queue).cloned());
        let Some(indices) = indices else {
            debug!(queue, "No workers bound to queue");
            return;
        };

        let workers = self.workers_snapshot();
        for index in indices {
            if let Some(worker) = workers.get(index) {
                worker.notify_new_message();
            }
        }
    }

    fn notify_all_workers(&self) {
        for worker in self.workers_snapshot() {
            worker.notify_new_message();
        }
    }

    fn report_error(&self, err: &MqError) {
        let callback = self.error_callback.read().ok().and_then(|c| c.clone());
        if let Some(callback) = callback {
            callback(err);
        }
    }

    /// Sleep for `delay`, returning early once disposed
    fn sleep_unless_disposed(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let Ok(mut guard) = self.retry_lock.lock() else {
            return;
        };
        while !self.status.is(WorkerStatus::Disposed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.retry_signal.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return,
            };
        }
    }

    /// Subscribe to the control topic until the server leaves `Started`.
    fn run_subscription(&self) -> Result<(), MqError> {
        if !self
            .status
            .try_transition(WorkerStatus::Starting, WorkerStatus::Started)
        {
            debug!(status = %self.status.load(), "Control loop start aborted");
            return Ok(());
        }
        self.times_started.fetch_add(1, Ordering::SeqCst);
        // a stop consumed by the status check of a previous run
        self.pending.take();
        info!(topic = %self.config.control_topic, "MQ server started");

        while self.status.is(WorkerStatus::Started) {
            let result = self.broker.subscribe(&self.config.control_topic, &mut |event| {
                self.on_control_event(event)
            });
            self.subscribed.store(false, Ordering::SeqCst);
            result?;
        }

        self.stop_workers();
        if self
            .status
            .try_transition(WorkerStatus::Stopping, WorkerStatus::Stopped)
        {
            info!("MQ server stopped");
        }
        Ok(())
    }

    fn on_control_event(&self, event: SubscriptionEvent) -> SubscriptionControl {
        if !self.status.is(WorkerStatus::Started) {
            return SubscriptionControl::Unsubscribe;
        }

        match event {
            SubscriptionEvent::Subscribed => {
                self.subscribed.store(true, Ordering::SeqCst);
                self.no_of_continuous_errors.store(0, Ordering::SeqCst);
                debug!(topic = %self.config.control_topic, "Subscribed to control topic");
                // anything published before the subscription went live
                self.notify_all_workers();
                SubscriptionControl::Continue
            }
            SubscriptionEvent::Message(payload) => match ControlMessage::parse(&payload) {
                ControlMessage::Command(subtype) => self.on_command(subtype.as_deref()),
                ControlMessage::Queue(queue) => {
                    self.notify_workers(&queue);
                    SubscriptionControl::Continue
                }
                ControlMessage::Empty => SubscriptionControl::Continue,
            },
        }
    }

    fn on_command(&self, subtype: Option<&str>) -> SubscriptionControl {
        let op = self.pending.take();
        debug!(op = %op, subtype, "Control command received");

        match op {
            WorkerOperation::Stop => {
                self.status
                    .try_transition(WorkerStatus::Started, WorkerStatus::Stopping);
                SubscriptionControl::Unsubscribe
            }
            WorkerOperation::Reset => SubscriptionControl::Unsubscribe,
            WorkerOperation::Restart => {
                self.stop_workers();
                self.start_workers();
                SubscriptionControl::Continue
            }
            WorkerOperation::NoOp => SubscriptionControl::Continue,
        }
    }

    fn on_control_error(&self, err: &MqError) {
        self.subscribed.store(false, Ordering::SeqCst);
        self.no_of_errors.fetch_add(1, Ordering::SeqCst);
        self.no_of_continuous_errors.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
        metrics::server_error();
        error!(error = %err, "Control loop failed");

        if !self
            .status
            .try_transition(WorkerStatus::Started, WorkerStatus::Stopped)
        {
            self.status
                .try_transition(WorkerStatus::Stopping, WorkerStatus::Stopped);
        }
        self.stop_workers();
        self.report_error(err);
    }
}

/// Message queue server
///
/// Cheap to clone; clones share the same workers and control thread.
#[derive(Clone)]
pub struct MqServer {
    shared: Arc<ServerShared>,
}

impl MqServer {
    pub fn new(broker: Arc<dyn MessageBroker>, config: MqServerConfig) -> Self {
        let shared = Arc::new(ServerShared {
            broker: Arc::clone(&broker),
            config,
            registry: Mutex::new(HandlerRegistry::new()),
            workers: RwLock::new(Vec::new()),
            queue_workers: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            status: AtomicStatus::new(WorkerStatus::Stopped),
            pending: PendingOperation::default(),
            control_thread: Mutex::new(None),
            control_threads_spawned: AtomicU64::new(0),
            subscribed: AtomicBool::new(false),
            times_started: AtomicU64::new(0),
            no_of_errors: AtomicU64::new(0),
            no_of_continuous_errors: AtomicU32::new(0),
            last_error: Mutex::new(None),
            error_callback: RwLock::new(None),
            retry_lock: Mutex::new(()),
            retry_signal: Condvar::new(),
        });

        let weak = Arc::downgrade(&shared);
        broker.on_failover(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                MqServer { shared }.handle_failover();
            }
        }));

        Self { shared }
    }

    pub fn config(&self) -> &MqServerConfig {
        &self.shared.config
    }

    pub fn broker(&self) -> Arc<dyn MessageBroker> {
        Arc::clone(&self.shared.broker)
    }

    /// Client publishing with this server's queue prefix and control topic
    pub fn client(&self) -> MqClient {
        MqClient::from_config(self.broker(), &self.shared.config)
    }

    /// Set the callback invoked on control-loop and worker-start failures
    pub fn set_error_callback(&self, callback: impl Fn(&MqError) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.error_callback.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    /// Register a single-threaded handler for `T`
    pub fn register_handler<T, R, F>(&self, handler: F) -> Result<(), MqError>
    where
        T: MqMessage,
        R: Serialize + 'static,
        F: Fn(&Message<T>) -> Result<Option<R>, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler_with(handler, None, 1)
    }

    /// Register a handler for `T` with an error callback and `thread_count` workers
    pub fn register_handler_with<T, R, F>(
        &self,
        handler: F,
        on_error: Option<Arc<ErrorCallback<T>>>,
        thread_count: usize,
    ) -> Result<(), MqError>
    where
        T: MqMessage,
        R: Serialize + 'static,
        F: Fn(&Message<T>) -> Result<Option<R>, HandlerError> + Send + Sync + 'static,
    {
        if self.shared.status.is(WorkerStatus::Disposed) {
            return Err(MqError::Disposed("register a handler on"));
        }

        let mut registry = self.shared.registry.lock()?;
        if self.shared.initialized.load(Ordering::SeqCst) {
            return Err(MqError::Config(format!(
                "cannot register {} after the server was initialized",
                T::TYPE_NAME
            )));
        }

        registry.register::<T, R>(Arc::new(handler), on_error, thread_count)?;
        info!(message_type = T::TYPE_NAME, thread_count, "Registered handler");
        Ok(())
    }

    /// Build workers from the registry. Idempotent.
    ///
    /// Per type, priority-queue workers are listed ahead of In-queue workers.
    pub fn init(&self) -> Result<(), MqError> {
        let registry = self.shared.registry.lock()?;
        if self.shared.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.shared.config;
        let mut workers = Vec::new();
        let mut queue_workers: HashMap<String, Vec<usize>> = HashMap::new();

        for entry in registry.entries() {
            let names = QueueNames::with_prefix(&config.queue_prefix, entry.type_name);
            let mut queues = Vec::with_capacity(2);
            if config.uses_priority_queue(entry.type_name) {
                queues.push(names.priority_q.clone());
            }
            queues.push(names.in_q.clone());

            for queue in queues {
                for _ in 0..entry.thread_count {
                    let context = HandlerContext {
                        queue: queue.clone(),
                        queue_prefix: config.queue_prefix.clone(),
                        notify_topic: config.control_topic.clone(),
                        retry_count: config.retry_count,
                        publish_responses: config.publishes_responses(entry.type_name),
                        publish_to_outq: config.publishes_to_outq(entry.type_name),
                        filters: config.filters.clone(),
                    };
                    let worker = MqWorker::new(
                        Arc::clone(&self.shared.broker),
                        Arc::clone(&entry.factory),
                        context,
                        Some(worker_error_handler(Arc::downgrade(&self.shared))),
                        config.reclaim,
                    );
                    queue_workers
                        .entry(queue.clone())
                        .or_default()
                        .push(workers.len());
                    workers.push(Arc::new(worker));
                }
            }
        }

        info!(
            handlers = registry.len(),
            workers = workers.len(),
            "Initialized MQ server"
        );
        *self.shared.workers.write()? = workers;
        *self.shared.queue_workers.write()? = queue_workers;
        self.shared.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn start(&self) -> Result<(), MqError> {
        let shared = &self.shared;
        match shared.status.load() {
            WorkerStatus::Disposed => return Err(MqError::Disposed("start")),
            WorkerStatus::Started => {
                // restart any stopped workers
                shared.start_workers();
                return Ok(());
            }
            _ => {}
        }

        self.init()?;

        if !shared
            .status
            .try_transition(WorkerStatus::Stopped, WorkerStatus::Starting)
        {
            if shared.status.is(WorkerStatus::Disposed) {
                return Err(MqError::Disposed("start"));
            }
            debug!(status = %shared.status.load(), "Start already in progress");
            return Ok(());
        }

        if shared.workers_snapshot().is_empty() {
            warn!("No handlers registered, MQ server not started");
            shared
                .status
                .try_transition(WorkerStatus::Starting, WorkerStatus::Stopped);
            return Ok(());
        }

        shared.start_workers();
        metrics::server_started();

        if shared.is_control_thread() {
            // retry after a control-loop error: the caller loops again
            return Ok(());
        }

        let mut slot = shared.control_thread.lock()?;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Detaching previous control thread still in keep-alive sleep");
        }
        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("mq-server-control".to_string())
            .spawn(move || control_thread_main(thread_shared));

        match spawned {
            Ok(handle) => {
                shared.control_threads_spawned.fetch_add(1, Ordering::SeqCst);
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                drop(slot);
                shared
                    .status
                    .try_transition(WorkerStatus::Starting, WorkerStatus::Stopped);
                shared.stop_workers();
                Err(MqError::Internal(format!("failed to spawn control thread: {}", e)))
            }
        }
    }

    /// Ask the control loop to stop; returns without waiting
    pub fn stop(&self) -> Result<(), MqError> {
        let shared = &self.shared;
        if shared.status.is(WorkerStatus::Disposed) {
            return Err(MqError::Disposed("stop"));
        }

        if shared
            .status
            .try_transition(WorkerStatus::Started, WorkerStatus::Stopping)
        {
            info!("Stopping MQ server");
            shared.pending.set(WorkerOperation::Stop);
            if let Err(e) = shared.send_command() {
                warn!(error = %e, "Failed to publish stop command");
            }
        }
        Ok(())
    }

    /// `stop()` then `start()`, waiting for the control loop to wind down in between
    pub fn restart(&self) -> Result<(), MqError> {
        self.stop()?;

        let policy = self.shared.config.reclaim;
        let deadline = Instant::now() + policy.grace + policy.interrupt_timeout;
        while self.shared.status.is(WorkerStatus::Stopping) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.shared.status.is(WorkerStatus::Stopping) {
            warn!("MQ server still stopping, restart skipped");
        }

        self.start()
    }

    /// Stop and restart every worker without dropping the control subscription
    pub fn restart_workers(&self) -> Result<(), MqError> {
        match self.shared.status.load() {
            WorkerStatus::Disposed => Err(MqError::Disposed("restart workers of")),
            WorkerStatus::Started => {
                self.shared.pending.set(WorkerOperation::Restart);
                self.shared.send_command()
            }
            _ => Ok(()),
        }
    }

    /// React to a broker topology change
    pub fn handle_failover(&self) {
        let shared = &self.shared;
        if shared.status.is(WorkerStatus::Disposed) {
            return;
        }

        if shared.subscribed.load(Ordering::SeqCst) {
            info!("Broker failover, re-subscribing control loop");
            shared.pending.set(WorkerOperation::Reset);
            if let Err(e) = shared.send_command() {
                warn!(error = %e, "Failed to publish reset command");
            }
        } else {
            info!("Broker failover, restarting MQ server");
            if let Err(e) = self.restart() {
                warn!(error = %e, "Restart after failover failed");
            }
        }
    }

    /// Stop everything and enter the terminal `Disposed` state. Idempotent.
    pub fn dispose(&self) {
        let shared = &self.shared;
        if shared.status.is(WorkerStatus::Disposed) {
            return;
        }

        let _ = self.stop();
        if !shared.status.dispose() {
            return;
        }
        info!("Disposing MQ server");

        let workers = shared.workers_snapshot();
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            worker.dispose();
        }

        let handle = shared.control_thread.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let interrupt_target = Arc::clone(shared);
            let outcome = reclaim_thread(handle, shared.config.reclaim, move || {
                interrupt_target.pending.set(WorkerOperation::Stop);
                let _ = interrupt_target.send_command();
                interrupt_target.retry_signal.notify_all();
            });
            if outcome == ReclaimOutcome::Leaked {
                warn!("Control thread leaked on dispose");
            }
        }
        metrics::workers_running(0);
        info!("MQ server disposed");
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.load()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    pub fn times_started(&self) -> u64 {
        self.shared.times_started.load(Ordering::SeqCst)
    }

    pub fn no_of_errors(&self) -> u64 {
        self.shared.no_of_errors.load(Ordering::SeqCst)
    }

    pub fn no_of_continuous_errors(&self) -> u32 {
        self.shared.no_of_continuous_errors.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Number of control threads spawned over the server's lifetime
    pub fn control_threads_spawned(&self) -> u64 {
        self.shared.control_threads_spawned.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<Arc<MqWorker>> {
        self.shared.workers_snapshot()
    }

    /// Workers bound to `queue`, in listing order
    pub fn workers_for(&self, queue: &str) -> Vec<Arc<MqWorker>> {
        let indices = self
            .shared
            .queue_workers
            .read()
            .ok()
            .and_then(|map| map.get(queue).cloned())
            .unwrap_or_default();
        let workers = self.shared.workers_snapshot();
        indices
            .into_iter()
            .filter_map(|i| workers.get(i).cloned())
            .collect()
    }

    /// Aggregate stats across all workers
    pub fn stats(&self) -> HandlerStatsSnapshot {
        let mut total = HandlerStatsSnapshot::named("All Handlers");
        for worker in self.shared.workers_snapshot() {
            total.add(&worker.stats());
        }
        total
    }

    pub fn worker_stats(&self) -> Vec<HandlerStatsSnapshot> {
        self.shared
            .workers_snapshot()
            .iter()
            .map(|w| w.stats())
            .collect()
    }

    pub fn worker_statuses(&self) -> Vec<String> {
        self.shared
            .workers_snapshot()
            .iter()
            .map(|w| w.status_line())
            .collect()
    }

    /// Human-readable report for diagnostics
    pub fn stats_description(&self) -> String {
        let workers = self.shared.workers_snapshot();
        let queues: Vec<&str> = workers.iter().map(|w| w.queue_name()).collect();

        let mut out = String::from("#MQ SERVER STATS:\n");
        let _ = writeln!(out, "===============");
        let _ = writeln!(out, "Current Status: {}", self.status());
        let _ = writeln!(out, "Listening On: {}", queues.join(", "));
        let _ = writeln!(out, "Times Started: {}", self.times_started());
        let _ = writeln!(out, "Num of Errors: {}", self.no_of_errors());
        let _ = writeln!(out, "Num of Continuous Errors: {}", self.no_of_continuous_errors());
        let _ = writeln!(out, "Last ErrorMsg: {}", self.last_error().unwrap_or_default());
        let _ = writeln!(out, "===============");
        for worker in &workers {
            let _ = writeln!(out, "{}", worker.stats());
            let _ = writeln!(out, "---------------\n");
        }
        out
    }
}

fn control_thread_main(shared: Arc<ServerShared>) {
    loop {
        let err = match shared.run_subscription() {
            Ok(()) => break,
            Err(e) => e,
        };
        shared.on_control_error(&err);

        let Some(retry_after) = shared.config.keep_alive_retry_after else {
            break;
        };
        let continuous = shared.no_of_continuous_errors.load(Ordering::SeqCst);
        let delay = retry_after + backoff_delay_capped(continuous, shared.config.max_backoff);
        info!(
            delay_ms = delay.as_millis() as u64,
            continuous_errors = continuous,
            "Retrying MQ server start"
        );
        shared.sleep_unless_disposed(delay);

        if !shared.is_control_thread() || shared.status.is(WorkerStatus::Disposed) {
            break;
        }
        let server = MqServer {
            shared: Arc::clone(&shared),
        };
        if let Err(e) = server.start() {
            warn!(error = %e, "MQ server restart failed");
            break;
        }
        if !shared.status.is(WorkerStatus::Starting) {
            break;
        }
    }
    debug!("Control thread exiting");
}

fn worker_error_handler(server: Weak<ServerShared>) -> WorkerErrorHandler {
    Arc::new(move |worker_id, err| {
        if let Some(shared) = server.upgrade() {
            replace_worker(&shared, worker_id, &err);
        }
    })
}

/// Swap the failed worker for a fresh clone on the same queue
fn replace_worker(shared: &ServerShared, worker_id: u64, err: &MqError) {
    if shared.status.is(WorkerStatus::Disposed) {
        return;
    }

    let Ok(mut workers) = shared.workers.write() else {
        return;
    };
    let Some(index) = workers.iter().position(|w| w.id() == worker_id) else {
        return;
    };

    let failed = Arc::clone(&workers[index]);
    let replacement = Arc::new(failed.clone_worker());
    workers[index] = Arc::clone(&replacement);
    drop(workers);

    warn!(
        queue = %failed.queue_name(),
        failed_worker = worker_id,
        replacement = replacement.id(),
        error = %err,
        "Replacing failed worker"
    );
    metrics::MqMetrics::new(failed.queue_name(), failed.type_name()).worker_restarted();

    match shared.status.load() {
        WorkerStatus::Started | WorkerStatus::Starting => {
            if let Err(e) = replacement.start() {
                warn!(queue = %replacement.queue_name(), error = %e, "Could not start replacement worker");
            }
        }
        WorkerStatus::Disposed => replacement.dispose(),
        _ => {}
    }
    failed.dispose();
}
