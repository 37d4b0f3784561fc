//! Spy and mock collaborators for the task core.

use crate::platform::{AddressSpace, NamespaceInode, PlatformContext};
use crate::slot::WakeSender;
use crate::time::{BlockTimer, Clock, Time};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::time::Duration;

/// Platform context that counts its calls.
#[derive(Debug, Default)]
pub(crate) struct SpyPlatform {
    prepare_sleeps: AtomicUsize,
    interrupts: AtomicUsize,
}

impl SpyPlatform {
    pub(crate) fn prepare_sleeps(&self) -> usize {
        self.prepare_sleeps.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl PlatformContext for SpyPlatform {
    fn prepare_sleep(&self) {
        self.prepare_sleeps.fetch_add(1, Ordering::SeqCst);
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Address space tracking activation balance. Starts active, the state a
/// task observes between blocks.
#[derive(Debug)]
pub(crate) struct SpyAddressSpace {
    /// +1 per activate, -1 per deactivate; 0 means "as created".
    balance: AtomicIsize,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
}

impl SpyAddressSpace {
    pub(crate) fn new() -> Self {
        Self {
            balance: AtomicIsize::new(0),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
        }
    }

    /// Whether activation state equals the state at creation.
    pub(crate) fn is_balanced(&self) -> bool {
        self.balance.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

impl AddressSpace for SpyAddressSpace {
    fn activate(&self) {
        self.balance.fetch_add(1, Ordering::SeqCst);
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.balance.fetch_sub(1, Ordering::SeqCst);
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reference-counting namespace inode.
#[derive(Debug)]
pub(crate) struct TestInode {
    refs: AtomicIsize,
}

impl TestInode {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicIsize::new(1),
        })
    }

    pub(crate) fn refs(&self) -> isize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl NamespaceInode for TestInode {
    fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A generic (non-sampled) clock advanced by hand. Exercises the
/// explicit-timer path of the block core.
#[derive(Debug)]
pub(crate) struct ManualClock {
    inner: Arc<Mutex<ManualClockInner>>,
}

#[derive(Debug)]
struct ManualClockInner {
    now: Time,
    timers: Vec<ManualTimerEntry>,
}

#[derive(Debug)]
struct ManualTimerEntry {
    deadline: Time,
    generation: u64,
    shared: Arc<ManualShared>,
}

#[derive(Debug)]
struct ManualShared {
    core: Mutex<ManualCore>,
}

#[derive(Debug)]
struct ManualCore {
    armed: Option<u64>,
    fired: bool,
    next_gen: u64,
    tx: WakeSender,
}

impl ManualClock {
    pub(crate) fn new(start: Time) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(ManualClockInner {
                now: start,
                timers: Vec::new(),
            })),
        })
    }

    /// Advances the clock, firing every timer whose deadline is reached.
    pub(crate) fn advance(&self, d: Duration) {
        let due = {
            let mut inner = self.inner.lock();
            inner.now = inner.now.add(d);
            let now = inner.now;
            let (due, rest) = inner
                .timers
                .drain(..)
                .partition::<Vec<_>, _>(|e| e.deadline <= now);
            inner.timers = rest;
            due
        };

        for entry in due {
            let mut core = entry.shared.core.lock();
            if core.armed == Some(entry.generation) {
                core.armed = None;
                core.fired = true;
                core.tx.send();
            }
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.inner.lock().now
    }

    fn new_timer(&self, tx: WakeSender) -> Box<dyn BlockTimer> {
        Box::new(ManualTimer {
            shared: Arc::new(ManualShared {
                core: Mutex::new(ManualCore {
                    armed: None,
                    fired: false,
                    next_gen: 0,
                    tx,
                }),
            }),
            queue: Arc::clone(&self.inner),
        })
    }
}

struct ManualTimer {
    shared: Arc<ManualShared>,
    queue: Arc<Mutex<ManualClockInner>>,
}

impl BlockTimer for ManualTimer {
    fn set_deadline(&mut self, deadline: Time) {
        let generation = {
            let mut core = self.shared.core.lock();
            core.next_gen += 1;
            core.armed = Some(core.next_gen);
            core.fired = false;
            core.next_gen
        };

        let mut queue = self.queue.lock();
        let now = queue.now;
        if deadline <= now {
            drop(queue);
            let mut core = self.shared.core.lock();
            if core.armed == Some(generation) {
                core.armed = None;
                core.fired = true;
                core.tx.send();
            }
            return;
        }
        queue.timers.push(ManualTimerEntry {
            deadline,
            generation,
            shared: Arc::clone(&self.shared),
        });
    }

    fn cancel(&mut self) -> bool {
        let mut core = self.shared.core.lock();
        core.armed = None;
        std::mem::take(&mut core.fired)
    }
}
