//! Error taxonomy surfaced by the task core.
//!
//! The block core never returns host-OS errors; its result is exclusively
//! `Ok(())`, [`BlockError::Interrupted`] or [`BlockError::Timeout`]. Lookups
//! signal "not visible" through zero-valued returns rather than errors.
//! Invariant violations abort via `panic!` and are never represented here.

/// Outcome of a blocking operation that did not complete via its event
/// channel.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The deadline elapsed before an event was received.
    #[error("deadline elapsed while blocked")]
    Timeout,

    /// The task was asked to abandon its current block. Cooperative: outer
    /// loops decide whether to unwind further.
    #[error("task interrupted while blocked")]
    Interrupted,
}

/// Refusal to admit a new task into the [`TaskSet`](crate::threads::TaskSet).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The task set is draining: no live tasks remain and the
    /// no-new-tasks-if-zero-live gate is set.
    #[error("no new tasks may be created once all tasks have exited")]
    NoNewTasks,

    /// The target namespace already holds the maximum number of tasks.
    #[error("namespace task limit exceeded")]
    TasksLimitExceeded,

    /// No free thread ID remains in one of the namespaces the task would be
    /// visible in.
    #[error("thread IDs exhausted in namespace")]
    TidExhausted,

    /// The target namespace's init process is exiting or has exited.
    #[error("namespace is being torn down")]
    NamespaceExiting,

    /// A task in the target thread group is performing a group-exit-and-exec;
    /// no sibling may join until it completes.
    #[error("thread group has an exec in progress")]
    GroupExecing,

    /// The target thread group has already been reaped.
    #[error("thread group has exited")]
    GroupExited,
}

/// Refusal to change session or process-group membership.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// setsid() by a process-group leader.
    #[error("thread group already leads a process group")]
    ProcessGroupLeader,

    /// setpgid() to a process group in a different session.
    #[error("target process group belongs to a different session")]
    ForeignSession,

    /// The target process group does not exist in the caller's namespace.
    #[error("no such process group")]
    NoSuchProcessGroup,
}
