//! PID namespaces: bimaps between thread IDs and tasks.
//!
//! A task is visible in a namespace if the namespace maps a thread ID to it;
//! every task visible in a namespace is also visible in all of its
//! ancestors. Lookup and enumeration take the owner's lock for the minimum
//! duration and return snapshots; 0 signifies "not visible here".

use crate::auth::UserNamespace;
use crate::platform::NamespaceInode;
use crate::task::Task;
use crate::threads::{
    NsUid, ProcessGroup, ProcessGroupId, Session, SessionId, TaskSet, ThreadGroup, ThreadId,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// The last namespace ID assigned, process-wide. Global rather than
/// per-TaskSet because the root namespace is constructed before the outer
/// system finishes initializing.
static LAST_NS_ID: AtomicU64 = AtomicU64::new(0);

pub struct PidNamespace {
    /// The TaskSet this namespace belongs to. Non-owning: the TaskSet
    /// transitively owns every namespace's mutable state.
    owner: Weak<TaskSet>,

    /// The namespace of the process that created this one; `None` for the
    /// root. Immutable.
    parent: Option<Arc<PidNamespace>>,

    /// Authority over privileged operations on this namespace. Immutable.
    userns: Arc<UserNamespace>,

    /// Unique, monotonically assigned across all namespaces. Immutable.
    id: u64,

    /// The filesystem object representing this namespace. Reference counting
    /// of the namespace is delegated to it.
    inode: OnceLock<Arc<dyn NamespaceInode>>,
}

impl PidNamespace {
    pub(crate) fn new(
        owner: &Arc<TaskSet>,
        parent: Option<Arc<PidNamespace>>,
        userns: Arc<UserNamespace>,
    ) -> Arc<Self> {
        let id = LAST_NS_ID.fetch_add(1, Ordering::Relaxed) + 1;
        let ns = Arc::new(Self {
            owner: Arc::downgrade(owner),
            parent,
            userns,
            id,
            inode: OnceLock::new(),
        });
        owner.register_namespace(&ns);
        ns
    }

    pub(crate) fn uid(&self) -> NsUid {
        NsUid(self.id)
    }

    /// A non-zero ID unique across PID namespaces.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn owner(&self) -> Arc<TaskSet> {
        // A namespace outliving its TaskSet has no meaningful operations
        // left; treat it as a fatal inconsistency rather than an error.
        self.owner.upgrade().expect("PID namespace outlived its TaskSet")
    }

    /// The user namespace associated with this PID namespace.
    pub fn user_namespace(&self) -> &Arc<UserNamespace> {
        &self.userns
    }

    /// The parent namespace, `None` for the root.
    pub fn parent(&self) -> Option<&Arc<PidNamespace>> {
        self.parent.as_ref()
    }

    /// The root PID namespace of the owning TaskSet.
    pub fn root(&self) -> Arc<PidNamespace> {
        self.owner().root().clone()
    }

    /// This namespace followed by its ancestors up to the root.
    pub(crate) fn self_and_ancestors(self: &Arc<Self>) -> Vec<Arc<PidNamespace>> {
        let mut chain = vec![Arc::clone(self)];
        let mut cursor = self.parent.clone();
        while let Some(ns) = cursor {
            cursor = ns.parent.clone();
            chain.push(ns);
        }
        chain
    }

    /// A new, empty namespace whose parent is `self`, owned by the same
    /// TaskSet, with authority controlled by `userns`. The provided inode is
    /// installed so the namespace is visible to the virtual file system.
    pub fn new_child(
        self: &Arc<Self>,
        userns: Arc<UserNamespace>,
        inode: Arc<dyn NamespaceInode>,
    ) -> Arc<PidNamespace> {
        let child = PidNamespace::new(&self.owner(), Some(Arc::clone(self)), userns);
        child.init_inode(inode);
        child
    }

    /// Installs the namespace's filesystem inode. Called once, after
    /// construction.
    pub fn init_inode(&self, inode: Arc<dyn NamespaceInode>) {
        if self.inode.set(inode).is_err() {
            panic!("namespace inode installed twice");
        }
    }

    /// The namespace type tag exposed to the virtual file system.
    pub fn ns_type(&self) -> &'static str {
        "pid"
    }

    /// Increments the namespace's reference count via its inode.
    pub fn inc_ref(&self) {
        if let Some(inode) = self.inode.get() {
            inode.inc_ref();
        }
    }

    /// Decrements the namespace's reference count via its inode.
    pub fn dec_ref(&self) {
        if let Some(inode) = self.inode.get() {
            inode.dec_ref();
        }
    }

    /// Tear-down is driven by reference drops through the namespace inode;
    /// destroying the namespace object itself is a no-op.
    pub fn destroy(&self) {}

    /// Whether the namespace's init process is exiting or has exited.
    /// Subsequent operations treat the namespace as terminal.
    pub fn is_exiting(&self) -> bool {
        self.owner().ns_is_exiting(self)
    }

    /// The task with thread ID `tid` in this namespace, or `None`.
    pub fn task_with_id(&self, tid: ThreadId) -> Option<Arc<Task>> {
        self.owner().task_with_id_in(self, tid)
    }

    /// The thread group led by the task with thread ID `tid` in this
    /// namespace. `None` if no task has that TID or it is not a leader.
    pub fn thread_group_with_id(&self, tid: ThreadId) -> Option<Arc<ThreadGroup>> {
        self.owner().thread_group_with_id_in(self, tid)
    }

    /// The TID assigned to `task` here, or 0 if it is not visible in this
    /// namespace. The zero return is significant: getppid() is specified to
    /// return 0 when the parent lives in an ancestor namespace.
    pub fn id_of_task(&self, task: &Arc<Task>) -> ThreadId {
        self.owner().id_of_task_in(self, task)
    }

    /// The TID assigned to `tg`'s leader here, or 0 if not visible.
    pub fn id_of_thread_group(&self, tg: &Arc<ThreadGroup>) -> ThreadId {
        self.owner().id_of_thread_group_in(self, tg)
    }

    /// A snapshot of the tasks visible in this namespace. Iteration order is
    /// unspecified.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks = Vec::new();
        self.tasks_append(&mut tasks);
        tasks
    }

    /// Appends a snapshot of the tasks visible in this namespace to `out`.
    pub fn tasks_append(&self, out: &mut Vec<Arc<Task>>) {
        self.owner().tasks_append_in(self, out);
    }

    /// The number of tasks visible in this namespace.
    pub fn num_tasks(&self) -> usize {
        self.owner().num_tasks_in(self)
    }

    /// The number of tasks visible in this namespace that belong to the
    /// given container.
    pub fn num_tasks_per_container(&self, cid: &str) -> usize {
        self.owner().num_tasks_per_container_in(self, cid)
    }

    /// A snapshot of the thread groups visible in this namespace.
    pub fn thread_groups(&self) -> Vec<Arc<ThreadGroup>> {
        let mut tgs = Vec::new();
        self.thread_groups_append(&mut tgs);
        tgs
    }

    /// Appends a snapshot of the thread groups visible in this namespace to
    /// `out`.
    pub fn thread_groups_append(&self, out: &mut Vec<Arc<ThreadGroup>>) {
        self.owner().thread_groups_append_in(self, out);
    }

    /// The session with ID `sid` in this namespace, or `None`.
    pub fn session_with_id(&self, sid: SessionId) -> Option<Arc<Session>> {
        self.owner().session_with_id_in(self, sid)
    }

    /// The session ID assigned to `session` here, or 0 if not visible.
    pub fn id_of_session(&self, session: &Arc<Session>) -> SessionId {
        self.owner().id_of_session_in(self, session)
    }

    /// The process group with ID `pgid` in this namespace, or `None`.
    pub fn process_group_with_id(&self, pgid: ProcessGroupId) -> Option<Arc<ProcessGroup>> {
        self.owner().process_group_with_id_in(self, pgid)
    }

    /// The process-group ID assigned to `pg` here, or 0 if not visible.
    pub fn id_of_process_group(&self, pg: &Arc<ProcessGroup>) -> ProcessGroupId {
        self.owner().id_of_process_group_in(self, pg)
    }
}

impl fmt::Debug for PidNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidNamespace")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
