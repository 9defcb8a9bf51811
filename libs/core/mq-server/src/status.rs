//! Lifecycle state shared by the server and its workers.
//!
//! Every transition is a compare-and-swap along a fixed table, so concurrent
//! `start`/`stop`/`dispose` calls from different threads elect a single winner.

use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use strum::{AsRefStr, Display};

/// Lifecycle status of a server or worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[repr(i32)]
pub enum WorkerStatus {
    Disposed = -1,
    Stopped = 0,
    Stopping = 1,
    Starting = 2,
    Started = 3,
}

impl WorkerStatus {
    fn from_i32(value: i32) -> Self {
        match value {
            -1 => WorkerStatus::Disposed,
            1 => WorkerStatus::Stopping,
            2 => WorkerStatus::Starting,
            3 => WorkerStatus::Started,
            _ => WorkerStatus::Stopped,
        }
    }
}

/// Whether `from → to` is an allowed lifecycle edge.
pub fn is_valid_transition(from: WorkerStatus, to: WorkerStatus) -> bool {
    use WorkerStatus::*;

    match (from, to) {
        (Disposed, _) => false,
        (_, Disposed) => true,
        (Stopped, Starting)
        | (Starting, Started)
        | (Starting, Stopped)
        | (Started, Stopping)
        | (Started, Stopped)
        | (Stopping, Stopped) => true,
        _ => false,
    }
}

/// Atomic cell holding a [`WorkerStatus`]
#[derive(Debug)]
pub struct AtomicStatus {
    value: AtomicI32,
}

impl AtomicStatus {
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            value: AtomicI32::new(status as i32),
        }
    }

    pub fn load(&self) -> WorkerStatus {
        WorkerStatus::from_i32(self.value.load(Ordering::SeqCst))
    }

    pub fn is(&self, status: WorkerStatus) -> bool {
        self.load() == status
    }

    /// Move `from → to` if the cell currently holds `from` and the edge is valid.
    ///
    /// Returns `true` only for the caller that performed the swap.
    pub fn try_transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        if !is_valid_transition(from, to) {
            return false;
        }

        self.value
            .compare_exchange(from as i32, to as i32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enter the terminal `Disposed` state.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn dispose(&self) -> bool {
        self.value.swap(WorkerStatus::Disposed as i32, Ordering::SeqCst)
            != WorkerStatus::Disposed as i32
    }

    /// Unconditionally reset a non-disposed cell to `Stopped`.
    ///
    /// Used after a forced thread reclaim, when the previous owner may have
    /// exited mid-transition.
    pub fn reset_to_stopped(&self) -> bool {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            if current == WorkerStatus::Disposed as i32 {
                return false;
            }
            match self.value.compare_exchange(
                current,
                WorkerStatus::Stopped as i32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Administrative operation carried out by the control loop on its next command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum WorkerOperation {
    NoOp = 0,
    Stop = 1,
    Reset = 2,
    Restart = 3,
}

impl WorkerOperation {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerOperation::Stop,
            2 => WorkerOperation::Reset,
            3 => WorkerOperation::Restart,
            _ => WorkerOperation::NoOp,
        }
    }
}

/// Pending-operation slot consumed exactly once per control command
#[derive(Debug, Default)]
pub struct PendingOperation {
    value: AtomicU8,
}

impl PendingOperation {
    pub fn set(&self, op: WorkerOperation) {
        self.value.store(op as u8, Ordering::SeqCst);
    }

    /// Read the pending operation and clear it back to `NoOp`
    pub fn take(&self) -> WorkerOperation {
        WorkerOperation::from_u8(self.value.swap(WorkerOperation::NoOp as u8, Ordering::SeqCst))
    }

    pub fn peek(&self) -> WorkerOperation {
        WorkerOperation::from_u8(self.value.load(Ordering::SeqCst))
    }
}
