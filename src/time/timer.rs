//! One-shot deadline timers backed by a process-wide wheel thread.

use crate::slot::WakeSender;
use crate::time::{SampledClock, Time};
use crate::utils;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// A one-shot deadline timer.
///
/// On fire, exactly one value is delivered to the timer's wake slot;
/// redundant fires are dropped by the slot itself. Re-arming an unfired timer
/// supersedes the previous deadline.
pub trait BlockTimer: Send {
    /// Arms the timer to fire at or after `deadline` on the creating clock.
    fn set_deadline(&mut self, deadline: Time);

    /// Disarms the timer. Returns whether it had already fired since the
    /// last arm, so callers know the wake slot may hold a stale expiry to
    /// drain.
    fn cancel(&mut self) -> bool;
}

#[derive(Debug)]
struct TimerCore {
    /// Generation currently armed, if any. Wheel entries from superseded
    /// arms carry stale generations and are dropped at fire time.
    armed: Option<u64>,

    /// Set when an armed generation fires; cleared by arm and cancel.
    fired: bool,

    next_gen: u64,

    tx: WakeSender,
}

#[derive(Debug)]
struct TimerShared {
    core: Mutex<TimerCore>,
}

impl TimerShared {
    /// Called by the wheel thread when a scheduled entry comes due.
    fn fire(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.armed == Some(generation) {
            core.armed = None;
            core.fired = true;
            core.tx.send();
        }
    }
}

/// Timer for sampled clocks, scheduled on the shared host wheel.
///
/// Each task owns one as its resident blocking timer; the block core re-arms
/// it per wait instead of allocating.
#[derive(Debug)]
pub struct WheelTimer {
    shared: Arc<TimerShared>,

    /// Host instant corresponding to the creating clock's zero.
    epoch: Instant,
}

impl WheelTimer {
    pub(crate) fn new(tx: WakeSender, epoch: Instant) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                core: Mutex::new(TimerCore {
                    armed: None,
                    fired: false,
                    next_gen: 0,
                    tx,
                }),
            }),
            epoch,
        }
    }

    fn arm_at(&self, when: Instant) {
        let generation = {
            let mut core = self.shared.core.lock();
            core.next_gen += 1;
            core.armed = Some(core.next_gen);
            core.fired = false;
            core.next_gen
        };
        wheel().schedule(when, generation, Arc::clone(&self.shared));
    }

    /// Arms the timer against an arbitrary sampled clock: the deadline is
    /// converted to a host instant by comparing it with the clock's now().
    /// A past deadline fires as soon as the wheel thread runs.
    pub fn set_deadline_from(&mut self, clock: &dyn SampledClock, deadline: Time) {
        let delay = deadline.duration_since(clock.now());
        self.arm_at(Instant::now() + delay);
    }
}

impl BlockTimer for WheelTimer {
    fn set_deadline(&mut self, deadline: Time) {
        let when = self
            .epoch
            .checked_add(Duration::from_nanos(deadline.ns().max(0) as u64))
            .unwrap_or_else(Instant::now);
        self.arm_at(when);
    }

    fn cancel(&mut self) -> bool {
        let mut core = self.shared.core.lock();
        core.armed = None;
        std::mem::take(&mut core.fired)
    }
}

struct WheelEntry {
    when: Instant,
    generation: u64,
    timer: Arc<TimerShared>,
}

// BinaryHeap is a max-heap; order entries so the earliest deadline is the
// greatest element.
impl Ord for WheelEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when)
    }
}

impl PartialOrd for WheelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WheelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.generation == other.generation
    }
}

impl Eq for WheelEntry {}

struct TimerWheel {
    entries: Mutex<BinaryHeap<WheelEntry>>,
    cond: Condvar,
}

impl TimerWheel {
    fn schedule(&self, when: Instant, generation: u64, timer: Arc<TimerShared>) {
        self.entries.lock().push(WheelEntry {
            when,
            generation,
            timer,
        });
        self.cond.notify_one();
    }

    fn run(&self) {
        let mut entries = self.entries.lock();
        loop {
            match entries.peek() {
                None => self.cond.wait(&mut entries),
                Some(head) if head.when <= Instant::now() => {
                    let entry = entries.pop().expect("peeked entry vanished");
                    // Fire outside the wheel lock; the wake may cascade into
                    // a sleeper unpark.
                    drop(entries);
                    entry.timer.fire(entry.generation);
                    entries = self.entries.lock();
                }
                Some(head) => {
                    let when = head.when;
                    self.cond.wait_until(&mut entries, when);
                }
            }
        }
    }
}

/// The process-wide wheel, with its driver thread spawned on first use.
fn wheel() -> &'static TimerWheel {
    static WHEEL: OnceLock<&'static TimerWheel> = OnceLock::new();
    *WHEEL.get_or_init(|| {
        let wheel: &'static TimerWheel = Box::leak(Box::new(TimerWheel {
            entries: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
        }));
        std::thread::spawn(move || {
            utils::thread::set_current_thread_name("vigil-timer");
            tracing::debug!("timer wheel thread started");
            wheel.run();
        });
        wheel
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::wake_pair;
    use crate::time::{Clock, MonotonicClock};
    use anyhow::Result;
    use std::thread;

    #[test]
    fn test_timer_fires_into_slot() -> Result<()> {
        let clock = MonotonicClock::new();
        let (tx, rx) = wake_pair();
        let mut timer = clock.new_timer(tx);

        timer.set_deadline(clock.now().add(Duration::from_millis(5)));

        let start = Instant::now();
        while !rx.is_full() {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(rx.try_recv());
        // One-shot: nothing further is delivered.
        assert!(!rx.is_full());
        assert!(timer.cancel());
        Ok(())
    }

    #[test]
    fn test_cancel_before_fire_reports_unfired() -> Result<()> {
        let clock = MonotonicClock::new();
        let (tx, rx) = wake_pair();
        let mut timer = clock.new_timer(tx);

        timer.set_deadline(clock.now().add(Duration::from_secs(60)));
        assert!(!timer.cancel());
        assert!(!rx.is_full());

        // A cancelled deadline never fires.
        thread::sleep(Duration::from_millis(10));
        assert!(!rx.is_full());
        Ok(())
    }

    #[test]
    fn test_cancel_after_fire_reports_fired_once() -> Result<()> {
        let clock = MonotonicClock::new();
        let (tx, rx) = wake_pair();
        let mut timer = clock.new_timer(tx);

        timer.set_deadline(clock.now());
        let start = Instant::now();
        while !rx.is_full() {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }

        assert!(timer.cancel());
        // The fired report is consumed by cancel.
        assert!(!timer.cancel());
        assert!(rx.try_recv());
        Ok(())
    }

    #[test]
    fn test_rearm_supersedes_previous_deadline() -> Result<()> {
        let clock = MonotonicClock::new();
        let (tx, rx) = wake_pair();
        let mut timer = clock.new_timer(tx);

        timer.set_deadline(clock.now().add(Duration::from_secs(60)));
        timer.set_deadline(clock.now().add(Duration::from_millis(5)));

        let start = Instant::now();
        while !rx.is_full() {
            assert!(start.elapsed() < Duration::from_secs(2), "timer never fired");
            thread::sleep(Duration::from_millis(1));
        }

        // Only the superseding arm delivers.
        assert!(rx.try_recv());
        thread::sleep(Duration::from_millis(5));
        assert!(!rx.is_full());
        Ok(())
    }
}
