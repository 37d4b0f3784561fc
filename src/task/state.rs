//! Task goroutine state accounting.

use crate::time::Time;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// Scheduling-state classification of a task goroutine, surfaced through
/// `/proc`-like views and consulted by watchdog liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskRunState {
    /// Executing (guest code or kernel code on the task's behalf).
    Running = 0,

    /// Blocked in the block core; an interrupt will wake it.
    BlockedInterruptible = 1,

    /// Blocked in a host-side operation it must not be interrupted out of.
    BlockedUninterruptible = 2,

    /// The task has begun exiting.
    Exiting = 3,
}

impl TaskRunState {
    fn from_u8(v: u8) -> TaskRunState {
        match v {
            0 => TaskRunState::Running,
            1 => TaskRunState::BlockedInterruptible,
            2 => TaskRunState::BlockedUninterruptible,
            3 => TaskRunState::Exiting,
            _ => unreachable!("invalid task run state {v}"),
        }
    }
}

/// Per-task account of the goroutine state.
///
/// Entering and leaving blocked states is strictly balanced; nested entries
/// push the enclosing classification and a balanced leave restores exactly
/// the prior one.
#[derive(Debug)]
pub(crate) struct RunStateAccount {
    /// Current classification, readable without the stack lock.
    state: AtomicU8,

    /// Enclosing classifications of nested enters.
    stack: Mutex<SmallVec<[u8; 4]>>,

    /// Nanoseconds of the last responsiveness signal, on the application
    /// monotonic clock.
    last_touch_ns: AtomicI64,
}

impl RunStateAccount {
    pub(crate) fn new(now: Time) -> Self {
        Self {
            state: AtomicU8::new(TaskRunState::Running as u8),
            stack: Mutex::new(SmallVec::new()),
            last_touch_ns: AtomicI64::new(now.ns()),
        }
    }

    pub(crate) fn current(&self) -> TaskRunState {
        TaskRunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn enter(&self, kind: TaskRunState) {
        let mut stack = self.stack.lock();
        stack.push(self.state.load(Ordering::Acquire));
        self.state.store(kind as u8, Ordering::Release);
    }

    pub(crate) fn leave(&self, kind: TaskRunState) {
        let mut stack = self.stack.lock();
        debug_assert_eq!(self.current(), kind, "unbalanced run-state leave");
        let prev = stack.pop().expect("run-state leave without matching enter");
        self.state.store(prev, Ordering::Release);
    }

    pub(crate) fn set_exiting(&self) {
        self.state
            .store(TaskRunState::Exiting as u8, Ordering::Release);
    }

    /// Records that the task goroutine is responsive.
    pub(crate) fn touch(&self, now: Time) {
        self.last_touch_ns.store(now.ns(), Ordering::Release);
    }

    pub(crate) fn last_activity(&self) -> Time {
        Time::from_ns(self.last_touch_ns.load(Ordering::Acquire))
    }
}
