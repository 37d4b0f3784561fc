//! Hosting a task goroutine on a dedicated thread.

use crate::task::{Current, Task, TaskGoroutineGuard};
use crate::threads::TaskSet;
use crate::utils::{self, ScopeGuard};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;

impl TaskSet {
    /// Spawns the task's goroutine: a named thread that holds the
    /// task-goroutine capability for the duration of `f` and is accounted in
    /// the running-goroutines group.
    pub fn run_task<F, R>(
        self: &Arc<Self>,
        task: Arc<Task>,
        f: F,
    ) -> Result<thread::JoinHandle<R>>
    where
        F: FnOnce(&Current<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let name = format!("task-{}", task.thread_id());
        self.running_goroutines().add(1);
        let ts = Arc::clone(self);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                utils::thread::set_current_thread_name(&name);
                let _running = ScopeGuard::new(|| ts.running_goroutines().done());

                let guard = TaskGoroutineGuard::enter(task);
                f(&guard.current())
            })
            .context("failed to spawn task goroutine");

        if handle.is_err() {
            self.running_goroutines().done();
        }
        handle
    }
}
