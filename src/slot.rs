//! Single-slot wake channels.
//!
//! A wake channel carries at most one pending wake. Senders fill the slot if
//! it is empty and drop redundant fills, so any number of notifications
//! coalesce into a single pending wake, the semantics the block core and the
//! interrupt channel rely on. A receiver that is about to sleep subscribes a
//! [`Sleeper`] so a late fill can unpark it.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Creates a connected single-slot channel.
pub fn wake_pair() -> (WakeSender, WakeReceiver) {
    let slot = Arc::new(Slot {
        full: AtomicBool::new(false),
        sleeper: Mutex::new(None),
    });

    (
        WakeSender {
            slot: Arc::clone(&slot),
        },
        WakeReceiver { slot },
    )
}

#[derive(Debug)]
struct Slot {
    full: AtomicBool,

    /// The sleeper to unpark on a fill, if a receiver is currently blocked.
    sleeper: Mutex<Option<Arc<Sleeper>>>,
}

/// Sending half. Cloneable: wait-queue entries and timers each hold one.
#[derive(Debug, Clone)]
pub struct WakeSender {
    slot: Arc<Slot>,
}

impl WakeSender {
    /// Fills the slot if it is empty. Redundant fills are dropped.
    pub fn send(&self) {
        if !self.slot.full.swap(true, Ordering::AcqRel) {
            // First fill since the last drain; unpark a subscribed sleeper.
            // A concurrent drain makes this a spurious unpark, which the
            // block core's rescan loop tolerates.
            if let Some(sleeper) = self.slot.sleeper.lock().as_ref() {
                sleeper.notify();
            }
        }
    }
}

/// Receiving half. Single consumer.
#[derive(Debug)]
pub struct WakeReceiver {
    slot: Arc<Slot>,
}

impl WakeReceiver {
    /// Drains the slot, returning whether a wake was pending.
    pub fn try_recv(&self) -> bool {
        self.slot.full.swap(false, Ordering::AcqRel)
    }

    /// Returns whether a wake is pending without draining it.
    pub fn is_full(&self) -> bool {
        self.slot.full.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self, sleeper: &Arc<Sleeper>) {
        *self.slot.sleeper.lock() = Some(Arc::clone(sleeper));
    }

    pub(crate) fn unsubscribe(&self) {
        *self.slot.sleeper.lock() = None;
    }
}

/// Park/unpark point for a task between wake-channel scans.
///
/// The block core subscribes one sleeper to up to three channels (event,
/// interrupt, timer) and parks on it; whichever channel fills first unparks
/// the task, which then rescans the channels to classify the wake. Spurious
/// unparks only cost a rescan.
#[derive(Debug, Default)]
pub(crate) struct Sleeper {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Sleeper {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn notify(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cond.notify_one();
    }

    /// Parks until notified. Consumes the pending notification.
    pub(crate) fn wait(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.cond.wait(&mut woken);
        }
        *woken = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_send_fills_once() -> Result<()> {
        let (tx, rx) = wake_pair();

        assert!(!rx.is_full());
        tx.send();
        tx.send();
        tx.send();

        // All sends coalesced into one pending wake.
        assert!(rx.is_full());
        assert!(rx.try_recv());
        assert!(!rx.try_recv());
        Ok(())
    }

    #[test]
    fn test_is_full_does_not_drain() -> Result<()> {
        let (tx, rx) = wake_pair();
        tx.send();

        assert!(rx.is_full());
        assert!(rx.is_full());
        assert!(rx.try_recv());
        assert!(!rx.is_full());
        Ok(())
    }

    #[test]
    fn test_send_unparks_sleeper() -> Result<()> {
        let (tx, rx) = wake_pair();
        let sleeper = Sleeper::new();
        rx.subscribe(&sleeper);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send();
        });

        sleeper.wait();
        assert!(rx.try_recv());
        rx.unsubscribe();
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_notify_before_wait_is_consumed() -> Result<()> {
        let sleeper = Sleeper::new();
        sleeper.notify();
        sleeper.wait();

        // A second wait would park; the pending notification was consumed.
        let woken = sleeper.woken.lock();
        assert!(!*woken);
        Ok(())
    }
}
