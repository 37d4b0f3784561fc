//! The TaskSet: every task in the system, and the lock domain relating
//! tasks, thread groups, sessions, process groups and PID namespaces.
//!
//! The TaskSet lock is the one coarse lock of the task core, the moral
//! equivalent of Linux's `tasklist_lock`: all inter-task and inter-group
//! relationships are mutated under it as writer and read under it as reader.
//! Task and ThreadGroup objects carry only identity and concurrency
//! primitives; their relationships live here, in typed tables keyed by
//! stable IDs, which keeps the task/group/namespace reference graph acyclic.

use crate::auth::UserNamespace;
use crate::errors::{AdmissionError, SessionError};
use crate::platform::{AddressSpace, PlatformContext};
use crate::task::{Task, TaskUid};
use crate::time::MonotonicClock;
use crate::utils::WaitGroup;
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

mod group;
pub use group::{
    EVENT_CHILD_GROUP_STOP, EVENT_EXIT, EVENT_GROUP_CONTINUE, EVENT_TRACEE_STOP, ProcessGroup,
    Session, ThreadGroup,
};

mod namespace;
pub use namespace::PidNamespace;


/// A thread identifier, scoped to one PID namespace. 0 signifies "not
/// visible in this namespace".
pub type ThreadId = i32;

/// Session and process-group identifiers share the thread-ID space of their
/// namespace.
pub type SessionId = i32;
pub type ProcessGroupId = i32;

/// The TID given to the first task added to each PID namespace. The thread
/// group led by it is the namespace's init process; its death tears the
/// namespace down.
pub const INIT_TID: ThreadId = 1;

/// Thread IDs are limited to 2^30 - 1 by the futex ABI.
pub(crate) const MAX_TID: ThreadId = (1 << 30) - 1;

/// The maximum number of tasks visible in one namespace. Resource limits are
/// expected to bite long before this does, but admission still checks it.
pub const TASKS_LIMIT: usize = 1 << 16;

macro_rules! table_uid {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub(crate) struct $name(pub(crate) u64);

        impl $name {
            pub(crate) fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                $name(COUNTER.fetch_add(1, Ordering::Relaxed))
            }
        }
    };
}

table_uid!(TgUid);
table_uid!(SessionUid);
table_uid!(PgUid);

/// Stable key for a namespace's table entry; the value is the namespace's
/// globally unique ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NsUid(pub(crate) u64);

/// Everything needed to admit a task.
pub struct TaskConfig {
    /// The group the task joins. A group with no admitted tasks yet makes
    /// the new task its leader.
    pub thread_group: Arc<ThreadGroup>,

    pub parent: Option<Arc<Task>>,

    pub container_id: String,

    pub platform: Arc<dyn PlatformContext>,

    pub address_space: Arc<dyn AddressSpace>,
}

/// All tasks in a system.
pub struct TaskSet {
    /// The application monotonic clock, shared with every task's blocking
    /// timer.
    clock: Arc<MonotonicClock>,

    /// The tasklist lock. Outermost lock of the task core; signal mutexes
    /// and wake-slot internals nest inside it.
    mu: RwLock<TaskSetState>,

    /// The root PID namespace, in which every task is visible. Immutable.
    root: OnceLock<Arc<PidNamespace>>,

    /// Live-task count, kept beside the tasklist lock so waiters for the
    /// zero transition never take `mu`. Mutated only while holding `mu` for
    /// writing, preserving the admission-gate atomicity.
    live: Mutex<LiveTasks>,
    zero_live_cond: Condvar,

    /// Running task goroutines. Zero before any checkpoint-equivalent
    /// operation.
    running_goroutines: WaitGroup,

    /// Goroutines running async I/O callbacks. Same zero requirement.
    aio_goroutines: WaitGroup,
}

#[derive(Debug, Default)]
struct LiveTasks {
    count: u32,

    /// Number of times the count has reached zero; lets observers confirm
    /// the broadcast happened.
    zero_transitions: u64,
}

#[derive(Default)]
struct TaskSetState {
    /// Active external stops (begin calls not yet paired with an end). While
    /// non-zero, the scheduler keeps task goroutines parked.
    stop_count: i32,

    /// When set and no live tasks remain, admission refuses new tasks.
    no_new_tasks_if_zero_live: bool,

    tasks: HashMap<TaskUid, TaskNode>,
    groups: HashMap<TgUid, GroupNode>,
    namespaces: HashMap<NsUid, NsState>,

    /// Thread-group membership counts for sessions and process groups;
    /// registry entries are dropped when a count reaches zero.
    session_refs: HashMap<SessionUid, usize>,
    pg_refs: HashMap<PgUid, usize>,
}

/// Relationship of one task to the rest of the system.
struct TaskNode {
    task: Arc<Task>,
    parent: Option<TaskUid>,
    children: HashSet<TaskUid>,
}

/// Relationship of one thread group to the rest of the system.
struct GroupNode {
    tg: Arc<ThreadGroup>,

    /// Fixed once the group becomes visible; survives the leader's own exit
    /// so waiters can keep reaching it.
    leader: Arc<Task>,

    /// Non-None while a member is performing a group-exit-and-exec.
    execing: Option<TaskUid>,

    /// Members not yet reaped, in attach order.
    members: Vec<TaskUid>,

    /// len(members); maintained explicitly so invariant checks are cheap.
    tasks_count: usize,

    /// Members that have not yet become zombies.
    live_tasks: usize,

    /// Members that have not yet initiated exit.
    active_tasks: usize,

    session: Option<Arc<Session>>,
    process_group: Option<Arc<ProcessGroup>>,
}

/// Per-namespace mutable state: the TID watermark and the four bimaps.
#[derive(Default)]
struct NsState {
    /// The last thread ID allocated here.
    last: ThreadId,

    tasks: HashMap<ThreadId, Arc<Task>>,
    tids: HashMap<TaskUid, ThreadId>,
    tgids: HashMap<TgUid, ThreadId>,

    sessions: HashMap<SessionId, Arc<Session>>,
    sids: HashMap<SessionUid, SessionId>,
    process_groups: HashMap<ProcessGroupId, Arc<ProcessGroup>>,
    pgids: HashMap<PgUid, ProcessGroupId>,

    /// Set when the namespace's init process starts exiting; the namespace
    /// is then terminal and admission into it is refused. All tasks visible
    /// here are killed by the broader exit machinery.
    exiting: bool,
}

impl TaskSet {
    /// Creates an empty TaskSet with a fresh root PID namespace under the
    /// given user-namespace authority.
    pub fn new(userns: Arc<UserNamespace>) -> Arc<Self> {
        let ts = Arc::new(Self {
            clock: MonotonicClock::new(),
            mu: RwLock::new(TaskSetState::default()),
            root: OnceLock::new(),
            live: Mutex::new(LiveTasks::default()),
            zero_live_cond: Condvar::new(),
            running_goroutines: WaitGroup::new(),
            aio_goroutines: WaitGroup::new(),
        });
        let root = PidNamespace::new(&ts, None, userns);
        ts.root.set(root).expect("root namespace installed twice");
        ts
    }

    /// The root PID namespace, in which all tasks are visible.
    pub fn root(&self) -> &Arc<PidNamespace> {
        self.root.get().expect("TaskSet has no root namespace")
    }

    /// The application monotonic clock.
    pub fn monotonic_clock(&self) -> &Arc<MonotonicClock> {
        &self.clock
    }

    pub(crate) fn running_goroutines(&self) -> &WaitGroup {
        &self.running_goroutines
    }

    /// Accounts a goroutine running an async I/O callback.
    pub fn begin_aio(&self) {
        self.aio_goroutines.add(1);
    }

    pub fn end_aio(&self) {
        self.aio_goroutines.done();
    }

    /// Blocks until no task goroutine is running.
    pub fn wait_for_no_running_tasks(&self) {
        self.running_goroutines.wait();
    }

    /// Blocks until no async I/O callback is running.
    pub fn wait_for_no_async_io(&self) {
        self.aio_goroutines.wait();
    }

    pub(crate) fn register_namespace(&self, ns: &Arc<PidNamespace>) {
        let mut state = self.mu.write();
        state.namespaces.insert(ns.uid(), NsState::default());
        tracing::debug!(ns = ns.id(), "registered PID namespace");
    }

    /// Creates a detached thread group in `ns`. The group becomes visible
    /// when its first task is admitted.
    pub fn new_thread_group(&self, ns: &Arc<PidNamespace>) -> Arc<ThreadGroup> {
        ThreadGroup::new(Arc::clone(ns))
    }

    /// The namespace new children of `parent` should join: the parent's
    /// child-namespace override if one is set, its own namespace otherwise.
    pub fn namespace_for_children(&self, parent: &Arc<Task>) -> Arc<PidNamespace> {
        parent
            .child_pid_namespace()
            .unwrap_or_else(|| Arc::clone(parent.pid_namespace()))
    }

    /// Admits a new task.
    ///
    /// Under the write lock: consults the no-new-tasks gate, the target
    /// group's exec marker, the namespace's terminal flag and task limit,
    /// allocates a thread ID in the target namespace and every ancestor, and
    /// registers the task (and, for a leader, its group) in all of them.
    pub fn new_task(&self, cfg: TaskConfig) -> Result<Arc<Task>, AdmissionError> {
        let tg = cfg.thread_group;
        let ns = Arc::clone(tg.pid_namespace());
        let chain = ns.self_and_ancestors();

        let mut state = self.mu.write();
        let mut live = self.live.lock();

        if state.no_new_tasks_if_zero_live && live.count == 0 {
            return Err(AdmissionError::NoNewTasks);
        }

        let is_leader = !state.groups.contains_key(&tg.uid());
        if !is_leader {
            let node = &state.groups[&tg.uid()];
            if node.execing.is_some() {
                return Err(AdmissionError::GroupExecing);
            }
            if node.active_tasks == 0 {
                return Err(AdmissionError::GroupExited);
            }
        }

        {
            let ns_state = state.ns(&ns);
            if ns_state.exiting {
                return Err(AdmissionError::NamespaceExiting);
            }
            if ns_state.tasks.len() >= TASKS_LIMIT {
                return Err(AdmissionError::TasksLimitExceeded);
            }
        }

        // Allocate a TID in the target namespace and each ancestor. The
        // watermark advances even if a later namespace fails; only
        // collision-freedom matters.
        let mut tids = SmallVec::<[ThreadId; 4]>::new();
        for n in &chain {
            tids.push(allocate_tid(state.ns_mut(n))?);
        }
        let own_tid = tids[0];

        let task = Task::new(
            Arc::clone(&tg),
            cfg.container_id,
            cfg.platform,
            cfg.address_space,
            Arc::clone(&self.clock),
        );
        let uid = task.uid();

        for (n, tid) in chain.iter().zip(&tids) {
            let ns_state = state.ns_mut(n);
            ns_state.tasks.insert(*tid, Arc::clone(&task));
            ns_state.tids.insert(uid, *tid);
            if is_leader {
                ns_state.tgids.insert(tg.uid(), *tid);
            }
        }

        if is_leader {
            // Fork inherits session and process group from the parent's
            // group.
            let (session, process_group) = cfg
                .parent
                .as_ref()
                .and_then(|p| state.groups.get(&p.thread_group().uid()))
                .map(|p| (p.session.clone(), p.process_group.clone()))
                .unwrap_or((None, None));
            if let Some(s) = &session {
                *state.session_refs.entry(s.uid).or_insert(0) += 1;
            }
            if let Some(pg) = &process_group {
                *state.pg_refs.entry(pg.uid).or_insert(0) += 1;
            }

            tg.set_pid_within_ns(own_tid);
            state.groups.insert(
                tg.uid(),
                GroupNode {
                    tg: Arc::clone(&tg),
                    leader: Arc::clone(&task),
                    execing: None,
                    members: vec![uid],
                    tasks_count: 1,
                    live_tasks: 1,
                    active_tasks: 1,
                    session,
                    process_group,
                },
            );
        } else {
            let _sig = tg.signal_lock();
            let node = state.groups.get_mut(&tg.uid()).expect("group vanished");
            node.members.push(uid);
            node.tasks_count += 1;
            node.live_tasks += 1;
            node.active_tasks += 1;
        }

        let parent_uid = cfg.parent.as_ref().map(|p| p.uid());
        state.tasks.insert(
            uid,
            TaskNode {
                task: Arc::clone(&task),
                parent: parent_uid,
                children: HashSet::new(),
            },
        );
        if let Some(p) = parent_uid
            && let Some(parent_node) = state.tasks.get_mut(&p)
        {
            parent_node.children.insert(uid);
        }

        live.count += 1;
        tracing::debug!(tid = own_tid, ns = ns.id(), leader = is_leader, "admitted task");
        Ok(task)
    }

    /// Marks the task as having initiated exit.
    pub fn begin_exit(&self, task: &Arc<Task>) {
        let mut state = self.mu.write();
        let tg = task.thread_group();
        let _sig = tg.signal_lock();
        let node = state.groups.get_mut(&tg.uid()).expect("exiting task has no group");
        node.active_tasks -= 1;
        task.note_exiting();
        tracing::trace!(task = task.uid().0, "task exit initiated");
    }

    /// Marks the task as a zombie: no longer live, but still visible until
    /// reaped. Notifies the parent's event queue; if the task leads its
    /// namespace's init process, the namespace becomes terminal.
    pub fn zombify(&self, task: &Arc<Task>) {
        let mut state = self.mu.write();
        let tg = task.thread_group();
        let node = state.groups.get_mut(&tg.uid()).expect("zombifying task has no group");
        node.live_tasks -= 1;

        let own_ns = task.pid_namespace();
        if state.ns(own_ns).tids.get(&task.uid()) == Some(&INIT_TID) {
            state.ns_mut(own_ns).exiting = true;
            tracing::debug!(ns = own_ns.id(), "namespace init exiting");
        }

        let parent_tg = state.tasks[&task.uid()]
            .parent
            .and_then(|p| state.tasks.get(&p))
            .map(|n| Arc::clone(n.task.thread_group()));
        if let Some(parent_tg) = parent_tg {
            parent_tg.event_queue().notify(EVENT_EXIT);
        }
    }

    /// Removes the task from every namespace it is visible in. A group
    /// leader is reaped last; reaping it removes the group itself.
    pub fn reap(&self, task: &Arc<Task>) {
        let mut state = self.mu.write();
        let tg = task.thread_group();
        let uid = task.uid();
        let chain = task.pid_namespace().self_and_ancestors();

        {
            let _sig = tg.signal_lock();
            let node = state.groups.get_mut(&tg.uid()).expect("reaped task has no group");
            assert!(
                node.leader.uid() != uid || node.tasks_count == 1,
                "thread group leader must be reaped last"
            );
            node.members.retain(|m| *m != uid);
            node.tasks_count -= 1;
        }

        for n in &chain {
            let ns_state = state.ns_mut(n);
            if let Some(tid) = ns_state.tids.remove(&uid) {
                ns_state.tasks.remove(&tid);
            }
        }

        if state.groups[&tg.uid()].tasks_count == 0 {
            for n in &chain {
                state.ns_mut(n).tgids.remove(&tg.uid());
            }
            tg.set_pid_within_ns(0);
            let node = state.groups.remove(&tg.uid()).expect("group vanished");
            release_session_membership(&mut state, node.session, node.process_group);
        }

        // Children are reparented to the namespace's init leader; orphaned
        // if init itself is going away.
        let node = state.tasks.remove(&uid).expect("reaped task not registered");
        if let Some(p) = node.parent
            && let Some(parent_node) = state.tasks.get_mut(&p)
        {
            parent_node.children.remove(&uid);
        }
        let init_uid = state
            .ns(task.pid_namespace())
            .tasks
            .get(&INIT_TID)
            .map(|t| t.uid())
            .filter(|init| *init != uid);
        for child in node.children {
            if let Some(child_node) = state.tasks.get_mut(&child) {
                child_node.parent = init_uid;
            }
            if let Some(init) = init_uid
                && let Some(init_node) = state.tasks.get_mut(&init)
            {
                init_node.children.insert(child);
            }
        }

        drop(state);
        let mut live = self.live.lock();
        live.count -= 1;
        if live.count == 0 {
            live.zero_transitions += 1;
            self.zero_live_cond.notify_all();
        }
        tracing::trace!(task = uid.0, "task reaped");
    }

    /// Marks `task` as performing a group-exit-and-exec in its group.
    pub fn begin_exec(&self, task: &Arc<Task>) {
        let mut state = self.mu.write();
        let node = state
            .groups
            .get_mut(&task.thread_group().uid())
            .expect("execing task has no group");
        node.execing = Some(task.uid());
    }

    /// Clears the group's exec marker.
    pub fn end_exec(&self, tg: &Arc<ThreadGroup>) {
        let mut state = self.mu.write();
        if let Some(node) = state.groups.get_mut(&tg.uid()) {
            node.execing = None;
        }
    }

    /// Begins an external stop applying to all tasks. While any is active,
    /// the scheduler keeps task goroutines parked.
    pub fn begin_external_stop(&self) {
        self.mu.write().stop_count += 1;
    }

    /// Ends an external stop begun with
    /// [`begin_external_stop`](TaskSet::begin_external_stop).
    pub fn end_external_stop(&self) {
        let mut state = self.mu.write();
        state.stop_count -= 1;
        assert!(state.stop_count >= 0, "unbalanced end_external_stop");
    }

    pub fn external_stop_count(&self) -> i32 {
        self.mu.read().stop_count
    }

    /// Arms the admission gate: once no live tasks remain, new tasks are
    /// refused.
    pub fn set_no_new_tasks_if_zero_live(&self, set: bool) {
        self.mu.write().no_new_tasks_if_zero_live = set;
    }

    /// The number of tasks whose goroutines have not exited.
    pub fn live_tasks(&self) -> u32 {
        self.live.lock().count
    }

    /// Blocks until no live tasks remain.
    pub fn wait_for_zero_live_tasks(&self) {
        let mut live = self.live.lock();
        while live.count != 0 {
            self.zero_live_cond.wait(&mut live);
        }
    }

    /// The number of times the live-task count has reached zero.
    pub fn zero_live_transitions(&self) -> u64 {
        self.live.lock().zero_transitions
    }

    /// Applies `f` to each thread group. `f` must not block: it runs under
    /// the reader lock.
    pub fn for_each_thread_group(&self, mut f: impl FnMut(&Arc<ThreadGroup>, &Arc<Task>)) {
        let state = self.mu.read();
        for tg_uid in state.ns(self.root()).tgids.keys() {
            if let Some(node) = state.groups.get(tg_uid) {
                f(&node.tg, &node.leader);
            }
        }
    }

    /// Applies `f` to each task. Same non-blocking requirement as
    /// [`for_each_thread_group`](TaskSet::for_each_thread_group).
    pub fn for_each_task(&self, mut f: impl FnMut(&Arc<Task>)) {
        let state = self.mu.read();
        for task in state.ns(self.root()).tasks.values() {
            f(task);
        }
    }

    /// Makes `tg` the leader of a new session and of a new process group
    /// within it, both named by the group's ID in each namespace it is
    /// visible in. Refuses if `tg` already leads a process group.
    pub fn create_session(&self, tg: &Arc<ThreadGroup>) -> Result<SessionId, SessionError> {
        let mut state = self.mu.write();
        let chain = tg.pid_namespace().self_and_ancestors();

        let node = state
            .groups
            .get(&tg.uid())
            .ok_or(SessionError::NoSuchProcessGroup)?;
        if let Some(pg) = &node.process_group
            && pg.originator == tg.uid()
        {
            return Err(SessionError::ProcessGroupLeader);
        }
        let old_session = node.session.clone();
        let old_pg = node.process_group.clone();

        let session = Arc::new(Session {
            uid: SessionUid::next(),
            leader: tg.uid(),
        });
        let pg = Arc::new(ProcessGroup {
            uid: PgUid::next(),
            session: Arc::clone(&session),
            originator: tg.uid(),
        });

        let mut own_sid = 0;
        for n in &chain {
            let ns_state = state.ns_mut(n);
            let Some(&tid) = ns_state.tgids.get(&tg.uid()) else {
                continue;
            };
            ns_state.sessions.insert(tid, Arc::clone(&session));
            ns_state.sids.insert(session.uid, tid);
            ns_state.process_groups.insert(tid, Arc::clone(&pg));
            ns_state.pgids.insert(pg.uid, tid);
            if Arc::ptr_eq(n, &chain[0]) {
                own_sid = tid;
            }
        }

        state.session_refs.insert(session.uid, 1);
        state.pg_refs.insert(pg.uid, 1);
        let node = state.groups.get_mut(&tg.uid()).expect("group vanished");
        node.session = Some(session);
        node.process_group = Some(pg);
        release_session_membership(&mut state, old_session, old_pg);

        tracing::debug!(sid = own_sid, "created session");
        Ok(own_sid)
    }

    /// Moves `tg` into `pg`, which must belong to the same session.
    pub fn join_process_group(
        &self,
        tg: &Arc<ThreadGroup>,
        pg: &Arc<ProcessGroup>,
    ) -> Result<(), SessionError> {
        let mut state = self.mu.write();
        let node = state
            .groups
            .get(&tg.uid())
            .ok_or(SessionError::NoSuchProcessGroup)?;
        let session = node.session.clone().ok_or(SessionError::ForeignSession)?;
        if session.uid != pg.session.uid {
            return Err(SessionError::ForeignSession);
        }
        if session.leader == tg.uid() {
            return Err(SessionError::ProcessGroupLeader);
        }

        let old_pg = node.process_group.clone();
        if let Some(old) = &old_pg
            && old.uid == pg.uid
        {
            return Ok(());
        }

        *state.pg_refs.entry(pg.uid).or_insert(0) += 1;
        let node = state.groups.get_mut(&tg.uid()).expect("group vanished");
        node.process_group = Some(Arc::clone(pg));
        release_session_membership(&mut state, None, old_pg);
        Ok(())
    }
}

/// Drops one membership reference on a session and/or process group,
/// clearing their namespace registrations when the last group leaves.
fn release_session_membership(
    state: &mut TaskSetState,
    session: Option<Arc<Session>>,
    pg: Option<Arc<ProcessGroup>>,
) {
    if let Some(pg) = pg {
        let refs = state.pg_refs.get_mut(&pg.uid).expect("untracked process group");
        *refs -= 1;
        if *refs == 0 {
            state.pg_refs.remove(&pg.uid);
            for ns_state in state.namespaces.values_mut() {
                if let Some(pgid) = ns_state.pgids.remove(&pg.uid) {
                    ns_state.process_groups.remove(&pgid);
                }
            }
        }
    }
    if let Some(session) = session {
        let refs = state
            .session_refs
            .get_mut(&session.uid)
            .expect("untracked session");
        *refs -= 1;
        if *refs == 0 {
            state.session_refs.remove(&session.uid);
            for ns_state in state.namespaces.values_mut() {
                if let Some(sid) = ns_state.sids.remove(&session.uid) {
                    ns_state.sessions.remove(&sid);
                }
            }
        }
    }
}

// Internal queries, routed here from PidNamespace/ThreadGroup/Task accessors
// so that every read takes the TaskSet lock exactly once.
impl TaskSet {
    pub(crate) fn task_with_id_in(&self, ns: &PidNamespace, tid: ThreadId) -> Option<Arc<Task>> {
        self.mu.read().ns(ns).tasks.get(&tid).cloned()
    }

    pub(crate) fn thread_group_with_id_in(
        &self,
        ns: &PidNamespace,
        tid: ThreadId,
    ) -> Option<Arc<ThreadGroup>> {
        let state = self.mu.read();
        let task = state.ns(ns).tasks.get(&tid)?;
        let node = state.groups.get(&task.thread_group().uid())?;
        if node.leader.uid() != task.uid() {
            return None;
        }
        Some(Arc::clone(&node.tg))
    }

    pub(crate) fn id_of_task_in(&self, ns: &PidNamespace, task: &Arc<Task>) -> ThreadId {
        self.mu
            .read()
            .ns(ns)
            .tids
            .get(&task.uid())
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn id_of_thread_group_in(&self, ns: &PidNamespace, tg: &Arc<ThreadGroup>) -> ThreadId {
        self.mu
            .read()
            .ns(ns)
            .tgids
            .get(&tg.uid())
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn tasks_append_in(&self, ns: &PidNamespace, out: &mut Vec<Arc<Task>>) {
        let state = self.mu.read();
        out.extend(state.ns(ns).tasks.values().cloned());
    }

    pub(crate) fn num_tasks_in(&self, ns: &PidNamespace) -> usize {
        self.mu.read().ns(ns).tids.len()
    }

    pub(crate) fn num_tasks_per_container_in(&self, ns: &PidNamespace, cid: &str) -> usize {
        let state = self.mu.read();
        state
            .ns(ns)
            .tasks
            .values()
            .filter(|t| t.container_id() == cid)
            .count()
    }

    pub(crate) fn thread_groups_append_in(&self, ns: &PidNamespace, out: &mut Vec<Arc<ThreadGroup>>) {
        let state = self.mu.read();
        for tg_uid in state.ns(ns).tgids.keys() {
            if let Some(node) = state.groups.get(tg_uid) {
                out.push(Arc::clone(&node.tg));
            }
        }
    }

    pub(crate) fn ns_is_exiting(&self, ns: &PidNamespace) -> bool {
        self.mu.read().ns(ns).exiting
    }

    pub(crate) fn session_with_id_in(&self, ns: &PidNamespace, sid: SessionId) -> Option<Arc<Session>> {
        self.mu.read().ns(ns).sessions.get(&sid).cloned()
    }

    pub(crate) fn id_of_session_in(&self, ns: &PidNamespace, session: &Arc<Session>) -> SessionId {
        self.mu
            .read()
            .ns(ns)
            .sids
            .get(&session.uid)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn process_group_with_id_in(
        &self,
        ns: &PidNamespace,
        pgid: ProcessGroupId,
    ) -> Option<Arc<ProcessGroup>> {
        self.mu.read().ns(ns).process_groups.get(&pgid).cloned()
    }

    pub(crate) fn id_of_process_group_in(
        &self,
        ns: &PidNamespace,
        pg: &Arc<ProcessGroup>,
    ) -> ProcessGroupId {
        self.mu
            .read()
            .ns(ns)
            .pgids
            .get(&pg.uid)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn leader_of(&self, tg: &ThreadGroup) -> Option<Arc<Task>> {
        self.mu
            .read()
            .groups
            .get(&tg.uid())
            .map(|n| Arc::clone(&n.leader))
    }

    pub(crate) fn execing_of(&self, tg: &ThreadGroup) -> Option<Arc<Task>> {
        let state = self.mu.read();
        let node = state.groups.get(&tg.uid())?;
        let uid = node.execing?;
        state.tasks.get(&uid).map(|n| Arc::clone(&n.task))
    }

    pub(crate) fn tasks_count_of(&self, tg: &ThreadGroup) -> usize {
        self.mu
            .read()
            .groups
            .get(&tg.uid())
            .map(|n| n.tasks_count)
            .unwrap_or(0)
    }

    pub(crate) fn member_ids_of(
        &self,
        tg: &ThreadGroup,
        pidns: &PidNamespace,
    ) -> SmallVec<[ThreadId; 8]> {
        let state = self.mu.read();
        let mut ids = SmallVec::new();
        let Some(node) = state.groups.get(&tg.uid()) else {
            return ids;
        };
        let ns_state = state.ns(pidns);
        for member in &node.members {
            if let Some(&tid) = ns_state.tids.get(member) {
                ids.push(tid);
            }
        }
        ids
    }

    pub(crate) fn for_each_task_in(&self, tg: &ThreadGroup, mut f: impl FnMut(&Arc<Task>) -> bool) {
        let state = self.mu.read();
        let Some(node) = state.groups.get(&tg.uid()) else {
            return;
        };
        for member in &node.members {
            if let Some(task_node) = state.tasks.get(member)
                && !f(&task_node.task)
            {
                break;
            }
        }
    }

    pub(crate) fn session_of(&self, tg: &ThreadGroup) -> Option<Arc<Session>> {
        self.mu.read().groups.get(&tg.uid())?.session.clone()
    }

    pub(crate) fn process_group_of(&self, tg: &ThreadGroup) -> Option<Arc<ProcessGroup>> {
        self.mu.read().groups.get(&tg.uid())?.process_group.clone()
    }

    pub(crate) fn parent_of(&self, task: &Arc<Task>) -> Option<Arc<Task>> {
        let state = self.mu.read();
        let parent = state.tasks.get(&task.uid())?.parent?;
        state.tasks.get(&parent).map(|n| Arc::clone(&n.task))
    }

    pub(crate) fn children_of(&self, task: &Arc<Task>) -> Vec<Arc<Task>> {
        let state = self.mu.read();
        let Some(node) = state.tasks.get(&task.uid()) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|c| state.tasks.get(c))
            .map(|n| Arc::clone(&n.task))
            .collect()
    }
}

impl TaskSetState {
    fn ns(&self, ns: &PidNamespace) -> &NsState {
        self.namespaces
            .get(&ns.uid())
            .expect("namespace not registered with this TaskSet")
    }

    fn ns_mut(&mut self, ns: &PidNamespace) -> &mut NsState {
        self.namespaces
            .get_mut(&ns.uid())
            .expect("namespace not registered with this TaskSet")
    }
}

/// Allocates a fresh thread ID in `ns`, advancing the watermark.
fn allocate_tid(ns: &mut NsState) -> Result<ThreadId, AdmissionError> {
    let tid = scan_free_tid(ns.last, MAX_TID, |tid| ns.tasks.contains_key(&tid))
        .ok_or(AdmissionError::TidExhausted)?;
    ns.last = tid;
    Ok(tid)
}

/// Finds the first free TID above `last`, wrapping to [`INIT_TID`] at `max`.
/// Returns `None` when every ID in the namespace is taken.
fn scan_free_tid(
    last: ThreadId,
    max: ThreadId,
    occupied: impl Fn(ThreadId) -> bool,
) -> Option<ThreadId> {
    for tid in (last + 1)..=max {
        if !occupied(tid) {
            return Some(tid);
        }
    }
    for tid in INIT_TID..=last.min(max) {
        if !occupied(tid) {
            return Some(tid);
        }
    }
    None
}
