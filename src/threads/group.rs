//! Thread groups, sessions and process groups.

use crate::task::Task;
use crate::threads::{PgUid, PidNamespace, SessionUid, TaskSet, TgUid, ThreadId};
use crate::waiter::{EventMask, Queue};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Delivered on a thread group's event queue when a child (or a tracee of a
/// member) becomes waitable. The queue uses its own bit-space, disjoint from
/// I/O readiness.
pub const EVENT_EXIT: EventMask = EventMask::from_bits_retain(1 << 0);
pub const EVENT_CHILD_GROUP_STOP: EventMask = EventMask::from_bits_retain(1 << 1);
pub const EVENT_TRACEE_STOP: EventMask = EventMask::from_bits_retain(1 << 2);
pub const EVENT_GROUP_CONTINUE: EventMask = EventMask::from_bits_retain(1 << 3);

/// A set of tasks sharing a leader, corresponding to a Linux tgid.
///
/// The object carries identity and the group's concurrency primitives;
/// membership, the leader reference, counters and the exec marker live in
/// the owning TaskSet's tables under its lock.
pub struct ThreadGroup {
    uid: TgUid,

    /// The PID namespace containing the group and all of its member tasks.
    /// Immutable.
    pidns: Arc<PidNamespace>,

    /// The leader's thread ID within `pidns`, atomically loadable so hot
    /// paths can answer `id()` without the TaskSet lock. Updated in lock-step
    /// with registry changes; 0 once the group has been reaped.
    pid_within_ns: AtomicI32,

    /// Notified whenever an event of interest to waitpid occurs in a child
    /// of this thread group.
    event_queue: Queue,

    /// The group's signal mutex. Nests strictly inside the TaskSet lock;
    /// membership counter mutations hold both.
    signal_mu: Mutex<()>,
}

impl ThreadGroup {
    pub(crate) fn new(pidns: Arc<PidNamespace>) -> Arc<Self> {
        Arc::new(Self {
            uid: TgUid::next(),
            pidns,
            pid_within_ns: AtomicI32::new(0),
            event_queue: Queue::new(),
            signal_mu: Mutex::new(()),
        })
    }

    pub(crate) fn uid(&self) -> TgUid {
        self.uid
    }

    /// The group leader's thread ID in the group's own PID namespace, or 0
    /// if the group has been reaped. Lock-free.
    pub fn id(&self) -> ThreadId {
        self.pid_within_ns.load(Ordering::Acquire)
    }

    pub(crate) fn set_pid_within_ns(&self, tid: ThreadId) {
        self.pid_within_ns.store(tid, Ordering::Release);
    }

    /// The PID namespace containing this group.
    pub fn pid_namespace(&self) -> &Arc<PidNamespace> {
        &self.pidns
    }

    /// The TaskSet containing this group.
    pub fn task_set(&self) -> Arc<TaskSet> {
        self.pidns.owner()
    }

    /// The parent/waitpid event queue.
    pub fn event_queue(&self) -> &Queue {
        &self.event_queue
    }

    pub(crate) fn signal_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.signal_mu.lock()
    }

    /// The group's leader. The leader survives its own exit and remains
    /// reachable while the group lives; `None` only before the group is made
    /// visible or after it has been reaped.
    pub fn leader(&self) -> Option<Arc<Task>> {
        self.task_set().leader_of(self)
    }

    /// The task performing a group-exit-and-exec, if one is underway.
    /// Callers that would admit a sibling into the group must check and
    /// refuse.
    pub fn execing(&self) -> Option<Arc<Task>> {
        self.task_set().execing_of(self)
    }

    /// The number of non-reaped tasks in the group.
    pub fn count(&self) -> usize {
        self.task_set().tasks_count_of(self)
    }

    /// A snapshot of the ThreadIDs (in `pidns`) of all tasks in the group.
    /// Tasks not visible in `pidns` are omitted.
    pub fn member_ids(&self, pidns: &Arc<PidNamespace>) -> SmallVec<[ThreadId; 8]> {
        self.task_set().member_ids_of(self, pidns)
    }

    /// Invokes `f` on each task in the group until it returns false.
    pub fn for_each_task(&self, f: impl FnMut(&Arc<Task>) -> bool) {
        self.task_set().for_each_task_in(self, f);
    }

    /// The group's session, if it has joined one.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.task_set().session_of(self)
    }

    /// The group's process group, if it has joined one.
    pub fn process_group(&self) -> Option<Arc<ProcessGroup>> {
        self.task_set().process_group_of(self)
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("uid", &self.uid)
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// A session: a set of process groups sharing a leader.
#[derive(Debug)]
pub struct Session {
    pub(crate) uid: SessionUid,

    /// The thread group that created the session.
    pub(crate) leader: TgUid,
}

/// A process group within a session.
#[derive(Debug)]
pub struct ProcessGroup {
    pub(crate) uid: PgUid,

    pub(crate) session: Arc<Session>,

    /// The thread group whose ID named the group at creation.
    pub(crate) originator: TgUid,
}

impl ProcessGroup {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}
