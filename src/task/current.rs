//! The task-goroutine capability.
//!
//! The block core may only be entered on the execution context exclusively
//! associated with a task. That precondition is encoded as a type:
//! [`Current`] is not `Send` and can only be borrowed from a
//! [`TaskGoroutineGuard`], which the task's run loop establishes on its own
//! thread. Debug builds additionally assert thread identity on every block.

use crate::task::Task;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Marks the current thread as a task's goroutine for the guard's lifetime.
pub struct TaskGoroutineGuard {
    task: Arc<Task>,
}

impl TaskGoroutineGuard {
    /// Enters the task's goroutine context on this thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already some task's goroutine; a thread hosts
    /// at most one task.
    pub fn enter(task: Arc<Task>) -> Self {
        CURRENT_TASK.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "thread is already a task goroutine; tasks do not share threads"
            );
            *current = Some(Arc::clone(&task));
        });
        Self { task }
    }

    /// The blocking capability for this task, usable only on this thread.
    pub fn current(&self) -> Current<'_> {
        Current {
            task: &self.task,
            _not_send: PhantomData,
        }
    }
}

impl Drop for TaskGoroutineGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| {
            *current.borrow_mut() = None;
        });
    }
}

/// Handle to the running task, obtainable only inside its own goroutine.
///
/// All blocking entry points live here; holding a `Current` is proof of
/// being on the task goroutine.
pub struct Current<'t> {
    task: &'t Arc<Task>,
    _not_send: PhantomData<*const ()>,
}

impl<'t> Current<'t> {
    pub fn task(&self) -> &Arc<Task> {
        self.task
    }

    /// Declares that all new children of this task should join `ns` instead
    /// of the task's own namespace. Exclusive to the task goroutine.
    pub fn set_child_pid_namespace(&self, ns: Option<Arc<crate::threads::PidNamespace>>) {
        *self.task.child_pidns.lock() = ns;
    }
}

impl Task {
    /// Debug-build check that the calling thread is this task's goroutine.
    /// The `Current` capability makes misuse a compile error for external
    /// callers; this catches capability smuggling inside the crate.
    pub(crate) fn assert_task_goroutine(&self) {
        if cfg!(debug_assertions) {
            let on_own_thread = CURRENT_TASK.with(|current| {
                current
                    .borrow()
                    .as_ref()
                    .is_some_and(|t| t.uid() == self.uid())
            });
            assert!(on_own_thread, "not called on the task goroutine");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::kernel_fixture;
    use anyhow::Result;

    #[test]
    fn test_guard_scopes_the_capability() -> Result<()> {
        let fixture = kernel_fixture()?;
        let task = fixture.init_task.clone();

        {
            let guard = TaskGoroutineGuard::enter(Arc::clone(&task));
            let current = guard.current();
            current.task().assert_task_goroutine();
        }

        // Guard dropped: a second enter on the same thread is allowed.
        let _guard = TaskGoroutineGuard::enter(task);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "already a task goroutine")]
    fn test_double_enter_panics() {
        let fixture = kernel_fixture().unwrap();
        let _g1 = TaskGoroutineGuard::enter(fixture.init_task.clone());
        let _g2 = TaskGoroutineGuard::enter(fixture.init_task.clone());
    }
}
