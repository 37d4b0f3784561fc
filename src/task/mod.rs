//! Tasks: the unit of execution and blocking.
//!
//! A [`Task`] is the simulated thread of control for guest code. The object
//! itself carries only identity and the task's concurrency primitives
//! (interrupt slot, resident blocking timer, sleeper, run-state account);
//! every relationship to other tasks lives in the owning
//! [`TaskSet`](crate::threads::TaskSet)'s tables, under its lock.

use crate::platform::{AddressSpace, PlatformContext};
use crate::slot::{Sleeper, WakeReceiver, WakeSender, wake_pair};
use crate::threads::{PidNamespace, TaskSet, ThreadGroup, ThreadId};
use crate::time::{Clock, MonotonicClock, WheelTimer};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

mod block;

mod current;
pub use current::{Current, TaskGoroutineGuard};

mod interrupt;

mod run;

mod state;
pub use state::TaskRunState;
use state::RunStateAccount;

#[cfg(test)]
mod tests;

/// Stable process-wide task identity, used to key the TaskSet's relationship
/// tables. Distinct from the per-namespace [`ThreadId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskUid(pub(crate) u64);

impl TaskUid {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskUid(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Task {
    uid: TaskUid,

    /// Owning thread group. Immutable after attach.
    tg: Arc<ThreadGroup>,

    /// Opaque container identifier.
    container_id: String,

    platform: Arc<dyn PlatformContext>,

    address_space: Arc<dyn AddressSpace>,

    /// The application monotonic clock, shared with the owning TaskSet.
    clock: Arc<MonotonicClock>,

    /// Single-slot interrupt channel.
    interrupt_tx: WakeSender,
    interrupt_rx: WakeReceiver,

    /// Resident blocking timer and its expiry slot. Re-armed per wait by the
    /// block core's sampled-clock path.
    blocking_timer: Mutex<WheelTimer>,
    timer_rx: WakeReceiver,

    /// Park point shared by the event, interrupt and timer slots while the
    /// task goroutine is blocked.
    sleeper: Arc<Sleeper>,

    run_state: RunStateAccount,

    /// Tracing region entered around each wait.
    block_span: tracing::Span,

    /// If set, new children of this task join this namespace instead of the
    /// task's own. Exclusive to the task goroutine.
    child_pidns: Mutex<Option<Arc<PidNamespace>>>,
}

impl Task {
    pub(crate) fn new(
        tg: Arc<ThreadGroup>,
        container_id: String,
        platform: Arc<dyn PlatformContext>,
        address_space: Arc<dyn AddressSpace>,
        clock: Arc<MonotonicClock>,
    ) -> Arc<Self> {
        let uid = TaskUid::next();
        let (interrupt_tx, interrupt_rx) = wake_pair();
        let (timer_tx, timer_rx) = wake_pair();
        let blocking_timer = Mutex::new(WheelTimer::new(timer_tx, clock.epoch()));
        let run_state = RunStateAccount::new(clock.now());
        let block_span = tracing::trace_span!("block", task = uid.0);

        Arc::new(Self {
            uid,
            tg,
            container_id,
            platform,
            address_space,
            clock,
            interrupt_tx,
            interrupt_rx,
            blocking_timer,
            timer_rx,
            sleeper: Sleeper::new(),
            run_state,
            block_span,
            child_pidns: Mutex::new(None),
        })
    }

    pub(crate) fn uid(&self) -> TaskUid {
        self.uid
    }

    /// The thread group containing this task.
    pub fn thread_group(&self) -> &Arc<ThreadGroup> {
        &self.tg
    }

    /// The PID namespace containing this task.
    pub fn pid_namespace(&self) -> &Arc<PidNamespace> {
        self.tg.pid_namespace()
    }

    /// The TaskSet containing this task.
    pub fn task_set(&self) -> Arc<TaskSet> {
        self.tg.task_set()
    }

    /// This task's thread ID in its own PID namespace, or 0 if it has been
    /// reaped.
    pub fn thread_id(self: &Arc<Self>) -> ThreadId {
        self.pid_namespace().id_of_task(self)
    }

    /// This task's thread-group ID in the root PID namespace.
    pub fn tgid_in_root(&self) -> ThreadId {
        self.task_set().root().id_of_thread_group(&self.tg)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// This task's parent, if it has one and it has not been reaped.
    pub fn parent(self: &Arc<Self>) -> Option<Arc<Task>> {
        self.task_set().parent_of(self)
    }

    /// A snapshot of this task's children.
    pub fn children(self: &Arc<Self>) -> Vec<Arc<Task>> {
        self.task_set().children_of(self)
    }

    /// Current scheduling-state classification, for observability.
    pub fn run_state(&self) -> TaskRunState {
        self.run_state.current()
    }

    /// Instant of the last responsiveness signal from the task goroutine, on
    /// the application monotonic clock. Watchdogs compare this against now().
    pub fn last_activity(&self) -> crate::time::Time {
        self.run_state.last_activity()
    }

    pub(crate) fn child_pid_namespace(&self) -> Option<Arc<PidNamespace>> {
        self.child_pidns.lock().clone()
    }

    pub(crate) fn note_exiting(&self) {
        self.run_state.set_exiting();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("uid", &self.uid)
            .field("container_id", &self.container_id)
            .field("run_state", &self.run_state.current())
            .finish_non_exhaustive()
    }
}
