//! The task block core.
//!
//! Blocking selects among three single-slot channels (the caller's event
//! channel, the task's interrupt channel and an optional timer expiry
//! channel) and classifies the wake. The address space is deactivated for
//! the duration of the sleep and restored on every exit path, and the
//! goroutine-state account tracks the sleep for observability.

use crate::errors::BlockError;
use crate::slot::WakeReceiver;
use crate::task::{Current, Task, TaskRunState};
use crate::time::{BlockTimer, Clock, SampledClock, Time};
use crate::utils::ScopeGuard;
use crate::waiter::{self, EventMask, Waitable};
use std::thread;
use std::time::Duration;

impl<'t> Current<'t> {
    /// Blocks until an event is received from `c` or the task is
    /// interrupted.
    pub fn block(&self, c: &WakeReceiver) -> Result<(), BlockError> {
        self.block_inner(c, None)
    }

    /// Blocks until an event is received from `c`, the application monotonic
    /// clock reaches `deadline` (only if `have_deadline`), or the task is
    /// interrupted.
    pub fn block_with_deadline(
        &self,
        c: &WakeReceiver,
        have_deadline: bool,
        deadline: Time,
    ) -> Result<(), BlockError> {
        if !have_deadline {
            return self.block_inner(c, None);
        }
        let clock = self.task().clock.clone();
        self.block_with_deadline_from_sampled(c, &*clock, deadline)
    }

    /// Like [`block_with_deadline`](Current::block_with_deadline), except the
    /// deadline is an instant on the passed clock. Most callers should use
    /// `block_with_deadline` or `block_with_timeout` instead.
    pub fn block_with_deadline_from(
        &self,
        c: &WakeReceiver,
        clock: &dyn Clock,
        have_deadline: bool,
        deadline: Time,
    ) -> Result<(), BlockError> {
        if !have_deadline {
            return self.block_inner(c, None);
        }

        if let Some(sampled) = clock.as_sampled() {
            return self.block_with_deadline_from_sampled(c, sampled, deadline);
        }

        // Generic clock: it has to mint its own timer object.
        let (tx, rx) = crate::slot::wake_pair();
        let mut timer = clock.new_timer(tx);
        timer.set_deadline(deadline);

        let result = self.block_inner(c, Some(&rx));

        // Stop the timer; drain the expiry slot only if the disarm observed
        // a fire, since an armed timer guarantees an empty slot.
        if timer.cancel() {
            rx.try_recv();
        }

        result
    }

    /// Blocks until an event is received from `c`, `timeout` elapses on the
    /// application monotonic clock (only if `have_timeout`), or the task is
    /// interrupted.
    ///
    /// Returns the remaining timeout, guaranteed to be zero if the timeout
    /// expired and unspecified if `have_timeout` is false, along with the
    /// block result.
    pub fn block_with_timeout(
        &self,
        c: &WakeReceiver,
        have_timeout: bool,
        timeout: Duration,
    ) -> (Duration, Result<(), BlockError>) {
        if !have_timeout {
            return (timeout, self.block_inner(c, None));
        }

        let clock = self.task().clock.clone();
        let start = clock.now();
        let deadline = start.add(timeout);
        let result = self.block_with_deadline_from_sampled(c, &*clock, deadline);

        // Timeout: explicitly report zero remaining.
        if result == Err(BlockError::Timeout) {
            return (Duration::ZERO, result);
        }

        // Even when the wake was not a timeout, time has passed since start;
        // clamp at zero so callers can reuse the value directly.
        let remaining = timeout.saturating_sub(clock.now().duration_since(start));
        (remaining, result)
    }

    /// Blocks until `w` delivers an event in `mask` or the task is
    /// interrupted. Returns whether an event arrived (as opposed to an
    /// interrupt).
    pub fn block_on(&self, w: &dyn Waitable, mask: EventMask) -> bool {
        let (entry, rx) = waiter::channel_entry(mask);
        w.event_register(&entry);
        let _unregister = ScopeGuard::new(|| w.event_unregister(&entry));
        self.block(&rx).is_ok()
    }

    /// Blocks until `w` delivers an event in `mask`, `timeout` elapses, or
    /// the task is interrupted. Returns the remaining timeout and whether an
    /// event arrived.
    pub fn block_with_timeout_on(
        &self,
        w: &dyn Waitable,
        mask: EventMask,
        timeout: Duration,
    ) -> (Duration, bool) {
        let (entry, rx) = waiter::channel_entry(mask);
        w.event_register(&entry);
        let _unregister = ScopeGuard::new(|| w.event_unregister(&entry));
        let (left, result) = self.block_with_timeout(&rx, true, timeout);
        (left, result.is_ok())
    }

    fn block_with_deadline_from_sampled(
        &self,
        c: &WakeReceiver,
        clock: &dyn SampledClock,
        deadline: Time,
    ) -> Result<(), BlockError> {
        let t = self.task();
        t.blocking_timer.lock().set_deadline_from(clock, deadline);

        let result = self.block_inner(c, Some(&t.timer_rx));

        // Stop the resident timer and drain its slot only if the disarm
        // observed a fire; see block_with_deadline_from.
        if t.blocking_timer.lock().cancel() {
            t.timer_rx.try_recv();
        }

        result
    }

    /// Blocks the task on one of up to three events.
    fn block_inner(
        &self,
        c: &WakeReceiver,
        timer_rx: Option<&WakeReceiver>,
    ) -> Result<(), BlockError> {
        let t = self.task();
        t.assert_task_goroutine();

        // Fast path if the request is already done. Deliberately precedes
        // the interrupt check so completed work is reported even when
        // interruption arrives concurrently.
        if c.try_recv() {
            return Ok(());
        }

        t.prepare_sleep();
        let _complete = ScopeGuard::new(|| t.complete_sleep());

        // If the timer has already expired, run through a scheduler cycle
        // before selecting: applications rely on timer slack actually
        // yielding the thread (e.g. short nanosleeps used as backoff).
        if timer_rx.is_some_and(|rx| rx.is_full()) {
            thread::yield_now();
        }

        c.subscribe(&t.sleeper);
        t.interrupt_rx.subscribe(&t.sleeper);
        if let Some(rx) = timer_rx {
            rx.subscribe(&t.sleeper);
        }
        let _unsubscribe = ScopeGuard::new(|| {
            c.unsubscribe();
            t.interrupt_rx.unsubscribe();
            if let Some(rx) = timer_rx {
                rx.unsubscribe();
            }
        });

        let _region = t.block_span.enter();
        loop {
            // Woken by event.
            if c.try_recv() {
                return Ok(());
            }

            if t.interrupt_rx.try_recv() {
                // Re-post so interrupted() stays true once control returns
                // to the task run loop.
                t.post_interrupt();
                return Err(BlockError::Interrupted);
            }

            // We've timed out.
            if timer_rx.is_some_and(|rx| rx.try_recv()) {
                return Err(BlockError::Timeout);
            }

            t.sleeper.wait();
        }
    }

    /// Enters an uninterruptible sleep for a host-side operation the task
    /// must not be interrupted out of. Changes only the accounting
    /// classification, and optionally deactivates the address space.
    pub fn uninterruptible_sleep_start(&self, deactivate: bool) {
        let t = self.task();
        t.assert_task_goroutine();
        if deactivate {
            t.address_space.deactivate();
        }
        t.run_state.enter(TaskRunState::BlockedUninterruptible);
    }

    /// Leaves an uninterruptible sleep, restoring the prior classification
    /// and optionally reactivating the address space.
    pub fn uninterruptible_sleep_finish(&self, activate: bool) {
        let t = self.task();
        t.run_state.leave(TaskRunState::BlockedUninterruptible);
        if activate {
            t.address_space.activate();
        }
    }
}

impl Task {
    fn prepare_sleep(&self) {
        self.platform.prepare_sleep();
        self.address_space.deactivate();
        self.run_state.enter(TaskRunState::BlockedInterruptible);
    }

    fn complete_sleep(&self) {
        self.run_state.leave(TaskRunState::BlockedInterruptible);
        self.address_space.activate();
    }
}
