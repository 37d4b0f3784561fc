//! The per-task interrupt channel.
//!
//! Interruption is the cancellation mechanism of the task core: it is
//! cooperative, causing the task's current block to terminate with
//! [`BlockError::Interrupted`](crate::errors::BlockError::Interrupted), and
//! it stays pending until explicitly cleared so outer loops can observe it.

use crate::task::{Current, Task};
use crate::time::Clock;

impl Task {
    /// Unblocks the task and asks the platform to abandon user-mode
    /// execution. Callable from any thread.
    pub fn interrupt(&self) {
        self.post_interrupt();
        self.platform.interrupt();
    }

    /// Fills the interrupt slot if empty. Redundant interrupts coalesce.
    pub(crate) fn post_interrupt(&self) {
        self.interrupt_tx.send();
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt_rx.is_full()
    }
}

impl Current<'_> {
    /// Like [`Task::interrupt`], but callable only from the task goroutine.
    ///
    /// The platform-side abort is skipped: a task goroutine posting to itself
    /// cannot simultaneously be running user code.
    pub fn interrupt_self(&self) {
        self.task().post_interrupt();
    }

    /// Returns whether an interrupt has been posted since the last
    /// [`unset_interrupted`](Current::unset_interrupted), without draining
    /// it.
    ///
    /// A `false` return doubles as a responsiveness signal: it touches the
    /// watchdog timestamp.
    pub fn interrupted(&self) -> bool {
        let t = self.task();
        if t.interrupt_pending() {
            return true;
        }
        t.run_state.touch(t.clock.now());
        false
    }

    /// Causes [`interrupted`](Current::interrupted) to return `false` until
    /// the next interrupt.
    pub fn unset_interrupted(&self) {
        self.task().interrupt_rx.try_recv();
    }
}
