//! Bounded reclamation of worker and control threads.
//!
//! Threads are joined cooperatively: wait a grace period, then interrupt
//! (re-signal cancellation and wake the thread), then wait again. A thread
//! that still does not exit is detached and reported as leaked; there is no
//! safe way to kill it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Timeouts used when reclaiming a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// How long to wait for a cooperative exit
    pub grace: Duration,
    /// How long to wait after the interrupt
    pub interrupt_timeout: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(500),
            interrupt_timeout: Duration::from_secs(3),
        }
    }
}

/// How a reclaim ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Exited within the grace period
    Joined,
    /// Exited after the interrupt
    Interrupted,
    /// Still running; detached
    Leaked,
    /// The caller is the thread itself; detached without waiting
    SelfReclaim,
    /// The thread panicked
    Panicked,
}

/// Reclaim `handle`, escalating from grace join to interrupt to leak.
///
/// `interrupt` is invoked once, only if the grace period expires.
pub fn reclaim_thread(
    handle: JoinHandle<()>,
    policy: ReclaimPolicy,
    interrupt: impl FnOnce(),
) -> ReclaimOutcome {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();

    if handle.thread().id() == thread::current().id() {
        debug!(thread = %name, "Skipping join of current thread");
        return ReclaimOutcome::SelfReclaim;
    }

    if wait_finished(&handle, policy.grace) {
        return join(handle, ReclaimOutcome::Joined);
    }

    warn!(
        thread = %name,
        grace_ms = policy.grace.as_millis() as u64,
        "Thread did not exit within grace period, interrupting"
    );
    interrupt();

    if wait_finished(&handle, policy.interrupt_timeout) {
        return join(handle, ReclaimOutcome::Interrupted);
    }

    error!(
        thread = %name,
        timeout_ms = policy.interrupt_timeout.as_millis() as u64,
        "Leaked thread: did not exit after interrupt, detaching"
    );
    drop(handle);
    ReclaimOutcome::Leaked
}

/// Run `f`, converting a panic into `Err(panic message)`
pub fn run_guarded<F, T>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(panic.as_ref()))
}

pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if handle.is_finished() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn join(handle: JoinHandle<()>, outcome: ReclaimOutcome) -> ReclaimOutcome {
    match handle.join() {
        Ok(()) => outcome,
        Err(_) => {
            warn!("Reclaimed thread had panicked");
            ReclaimOutcome::Panicked
        }
    }
}
