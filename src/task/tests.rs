use super::*;
use crate::errors::BlockError;
use crate::slot::wake_pair;
use crate::task::TaskGoroutineGuard;
use crate::test_utils::{ManualClock, kernel_fixture};
use crate::time::{Clock, Time};
use crate::waiter::{EventMask, Queue};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Task: Send, Sync);
assert_impl_all!(crate::threads::TaskSet: Send, Sync);

/// Generous upper bound for wall-clock assertions; loaded CI machines add
/// scheduler latency.
const SLACK: Duration = Duration::from_millis(500);

#[test]
fn test_block_event_before_block() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    tx.send();

    assert_eq!(current.block(&rx), Ok(()));

    // The fast path returns before any state change: no sleep was prepared
    // and the address space was never touched.
    assert_eq!(fixture.platform.prepare_sleeps(), 0);
    assert_eq!(fixture.aspace.deactivations(), 0);
    assert!(fixture.aspace.is_balanced());

    // Exactly one value was consumed.
    assert!(!rx.is_full());
    Ok(())
}

#[test]
fn test_block_event_during_block() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    let live_before = fixture.ts.live_tasks();

    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        tx.send();
    });

    let start = Instant::now();
    assert_eq!(current.block(&rx), Ok(()));
    let elapsed = start.elapsed();
    waker.join().unwrap();

    assert!(elapsed >= Duration::from_millis(10), "woke early: {elapsed:?}");
    assert_eq!(fixture.ts.live_tasks(), live_before);

    // The sleep was prepared and fully unwound.
    assert_eq!(fixture.platform.prepare_sleeps(), 1);
    assert_eq!(fixture.aspace.deactivations(), 1);
    assert_eq!(fixture.aspace.activations(), 1);
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[rstest]
#[case::twenty(Duration::from_millis(20))]
#[case::fifty(Duration::from_millis(50))]
fn test_block_with_timeout_expires(#[case] timeout: Duration) -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (_tx, rx) = wake_pair();

    let start = Instant::now();
    let (remaining, result) = current.block_with_timeout(&rx, true, timeout);
    let elapsed = start.elapsed();

    assert_eq!(result, Err(BlockError::Timeout));
    assert_eq!(remaining, Duration::ZERO);
    assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
    assert!(elapsed < timeout + SLACK, "timed out late: {elapsed:?}");
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[test]
fn test_block_with_timeout_event_leaves_remaining() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        tx.send();
    });

    let (remaining, result) = current.block_with_timeout(&rx, true, Duration::from_secs(10));
    waker.join().unwrap();

    // A non-timeout wake consumed the event and reports the time left.
    assert_eq!(result, Ok(()));
    assert!(remaining > Duration::ZERO);
    assert!(remaining <= Duration::from_secs(10));
    Ok(())
}

#[test]
fn test_block_with_timeout_without_timeout_returns_input() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    tx.send();

    let sentinel = Duration::from_nanos(1234);
    let (remaining, result) = current.block_with_timeout(&rx, false, sentinel);

    assert_eq!(result, Ok(()));
    assert_eq!(remaining, sentinel);
    Ok(())
}

#[test]
fn test_interrupt_wins() -> Result<()> {
    let fixture = kernel_fixture()?;
    let task = fixture.init_task.clone();
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (_tx, rx) = wake_pair();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        task.interrupt();
    });

    assert_eq!(current.block(&rx), Err(BlockError::Interrupted));
    interrupter.join().unwrap();

    // The interrupt was re-posted, so it stays observable until cleared.
    assert!(current.interrupted());
    assert!(current.interrupted());
    current.unset_interrupted();
    assert!(!current.interrupted());

    // The cross-thread interrupt also asked the platform to abort.
    assert_eq!(fixture.platform.interrupts(), 1);
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[test]
fn test_pending_interrupt_short_circuits_next_block() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    current.interrupt_self();

    // Every subsequent block terminates with Interrupted without consuming
    // the event channel, until the interrupt is cleared.
    let (_tx, rx) = wake_pair();
    assert_eq!(current.block(&rx), Err(BlockError::Interrupted));
    assert_eq!(current.block(&rx), Err(BlockError::Interrupted));

    current.unset_interrupted();
    assert!(!current.interrupted());
    Ok(())
}

#[test]
fn test_fast_path_precedes_pending_interrupt() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    tx.send();
    current.interrupt_self();

    // Completed work is reported even though interruption arrived
    // concurrently; the interrupt stays pending.
    assert_eq!(current.block(&rx), Ok(()));
    assert!(current.interrupted());
    current.unset_interrupted();
    Ok(())
}

#[test]
fn test_block_with_past_deadline_times_out() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (_tx, rx) = wake_pair();
    let now = fixture.ts.monotonic_clock().now();

    let start = Instant::now();
    let result = current.block_with_deadline(&rx, true, now);

    assert_eq!(result, Err(BlockError::Timeout));
    assert!(start.elapsed() < SLACK);
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[test]
fn test_block_without_deadline_ignores_deadline_value() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let (tx, rx) = wake_pair();
    tx.send();

    assert_eq!(current.block_with_deadline(&rx, false, Time::ZERO), Ok(()));
    Ok(())
}

#[test]
fn test_block_with_deadline_from_generic_clock() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let clock = ManualClock::new(Time::from_ns(1_000));
    assert!(clock.as_sampled().is_none());

    let (_tx, rx) = wake_pair();
    let deadline = clock.now().add(Duration::from_micros(100));

    let ticker = {
        let clock = clock.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            clock.advance(Duration::from_millis(1));
        })
    };

    let result = current.block_with_deadline_from(&rx, &*clock, true, deadline);
    ticker.join().unwrap();

    assert_eq!(result, Err(BlockError::Timeout));
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[test]
fn test_block_with_deadline_from_generic_clock_event_wins() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let clock = ManualClock::new(Time::ZERO);
    let (tx, rx) = wake_pair();
    let deadline = clock.now().add(Duration::from_secs(60));

    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        tx.send();
    });

    let result = current.block_with_deadline_from(&rx, &*clock, true, deadline);
    waker.join().unwrap();

    // The unfired deadline leaves no stale expiry behind for the task.
    assert_eq!(result, Ok(()));
    Ok(())
}

#[test]
fn test_stale_timer_still_reports_timeout() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    // A deadline that already passed on a generic clock fires at arm time,
    // pre-populating the timer slot before the selection loop; the block
    // must still classify the wake as a timeout (after its courtesy yield).
    let clock = ManualClock::new(Time::from_ns(1_000_000));
    let (_tx, rx) = wake_pair();

    let start = Instant::now();
    let result = current.block_with_deadline_from(&rx, &*clock, true, Time::from_ns(1));

    assert_eq!(result, Err(BlockError::Timeout));
    assert!(start.elapsed() < SLACK);
    Ok(())
}

#[test]
fn test_block_on_event() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let queue = Arc::new(Queue::new());
    let notifier = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            queue.notify(EventMask::READABLE);
        })
    };

    assert!(current.block_on(&*queue, EventMask::READABLE));
    notifier.join().unwrap();

    // The entry was unregistered on the way out.
    assert!(queue.is_empty());
    Ok(())
}

#[test]
fn test_block_on_interrupt_reports_no_event() -> Result<()> {
    let fixture = kernel_fixture()?;
    let task = fixture.init_task.clone();
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let queue = Queue::new();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        task.interrupt();
    });

    assert!(!current.block_on(&queue, EventMask::READABLE));
    interrupter.join().unwrap();
    assert!(queue.is_empty());
    current.unset_interrupted();
    Ok(())
}

#[test]
fn test_block_with_timeout_on_expires() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();

    let queue = Queue::new();
    let (remaining, got_event) =
        current.block_with_timeout_on(&queue, EventMask::READABLE, Duration::from_millis(20));

    assert!(!got_event);
    assert_eq!(remaining, Duration::ZERO);
    assert!(queue.is_empty());
    Ok(())
}

#[test]
fn test_uninterruptible_sleep_round_trip() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();
    let task = current.task();

    assert_eq!(task.run_state(), TaskRunState::Running);

    current.uninterruptible_sleep_start(true);
    assert_eq!(task.run_state(), TaskRunState::BlockedUninterruptible);
    assert!(!fixture.aspace.is_balanced());

    current.uninterruptible_sleep_finish(true);
    assert_eq!(task.run_state(), TaskRunState::Running);
    assert!(fixture.aspace.is_balanced());

    // Without address-space involvement, only the classification changes.
    current.uninterruptible_sleep_start(false);
    current.uninterruptible_sleep_finish(false);
    assert_eq!(fixture.aspace.deactivations(), 1);
    assert!(fixture.aspace.is_balanced());
    Ok(())
}

#[test]
fn test_blocked_state_visible_while_sleeping() -> Result<()> {
    let fixture = kernel_fixture()?;
    let task = fixture.init_task.clone();
    let ts = fixture.ts.clone();

    let (tx, rx) = wake_pair();
    let handle = ts.run_task(fixture.init_task.clone(), move |current| {
        current.block(&rx)
    })?;

    // Wait until the goroutine reports itself blocked, then wake it.
    let start = Instant::now();
    while task.run_state() != TaskRunState::BlockedInterruptible {
        assert!(start.elapsed() < Duration::from_secs(2), "never blocked");
        thread::sleep(Duration::from_millis(1));
    }
    tx.send();

    assert_eq!(handle.join().unwrap(), Ok(()));
    assert_eq!(task.run_state(), TaskRunState::Running);

    ts.wait_for_no_running_tasks();
    Ok(())
}

#[test]
fn test_interrupted_touches_watchdog() -> Result<()> {
    let fixture = kernel_fixture()?;
    let guard = TaskGoroutineGuard::enter(fixture.init_task.clone());
    let current = guard.current();
    let task = current.task();

    let before = task.last_activity();
    thread::sleep(Duration::from_millis(2));

    assert!(!current.interrupted());
    assert!(task.last_activity() > before);
    Ok(())
}
