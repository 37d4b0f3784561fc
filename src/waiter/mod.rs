//! Waitable objects and masked event subscription.
//!
//! A [`Queue`] is the notification side of a waitable object: subscribers
//! register a [`WaitEntry`] carrying an event mask and a wake-slot sender,
//! and `notify` fills the slot of every entry whose mask intersects the
//! delivered events. Repeated notifications coalesce into a single pending
//! wake per entry.

use crate::slot::{WakeReceiver, WakeSender, wake_pair};
use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Events a waitable object can deliver. Queues whose events are not
    /// I/O-shaped (e.g. thread-group child events) define their own constants
    /// over the same bit-space with `from_bits_retain`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EventMask: u64 {
        const READABLE = 1;
        const PRIORITY = 1 << 1;
        const WRITABLE = 1 << 2;
        const ERROR = 1 << 3;
        const HANG_UP = 1 << 4;
    }
}

/// Anything tasks can block on through the waiter protocol.
pub trait Waitable {
    fn event_register(&self, entry: &WaitEntry);
    fn event_unregister(&self, entry: &WaitEntry);
}

/// A subscriber on a waitable object.
///
/// Entries are identified by an ID unique across the process, so
/// register/unregister pairs need no allocation inside the queue beyond the
/// entry list itself.
#[derive(Debug)]
pub struct WaitEntry {
    id: u64,
    mask: EventMask,
    tx: WakeSender,
}

impl WaitEntry {
    fn next_id() -> u64 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }
}

/// Creates a subscriber interested in `mask`, plus the receiving half of its
/// wake slot.
pub fn channel_entry(mask: EventMask) -> (WaitEntry, WakeReceiver) {
    let (tx, rx) = wake_pair();
    (
        WaitEntry {
            id: WaitEntry::next_id(),
            mask,
            tx,
        },
        rx,
    )
}

#[derive(Debug)]
struct EntrySlot {
    id: u64,
    mask: EventMask,
    tx: WakeSender,
}

/// The subscriber list of a waitable object.
#[derive(Debug, Default)]
pub struct Queue {
    entries: Mutex<SmallVec<[EntrySlot; 4]>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `events` to every subscriber whose mask intersects them.
    pub fn notify(&self, events: EventMask) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            if entry.mask.intersects(events) {
                entry.tx.send();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Waitable for Queue {
    fn event_register(&self, entry: &WaitEntry) {
        self.entries.lock().push(EntrySlot {
            id: entry.id,
            mask: entry.mask,
            tx: entry.tx.clone(),
        });
    }

    fn event_unregister(&self, entry: &WaitEntry) {
        self.entries.lock().retain(|slot| slot.id != entry.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_notify_respects_mask() -> Result<()> {
        let q = Queue::new();
        let (reader, reader_rx) = channel_entry(EventMask::READABLE);
        let (writer, writer_rx) = channel_entry(EventMask::WRITABLE);
        q.event_register(&reader);
        q.event_register(&writer);

        q.notify(EventMask::READABLE | EventMask::HANG_UP);

        assert!(reader_rx.try_recv());
        assert!(!writer_rx.try_recv());

        q.event_unregister(&reader);
        q.event_unregister(&writer);
        Ok(())
    }

    #[test]
    fn test_repeated_notifications_coalesce() -> Result<()> {
        let q = Queue::new();
        let (entry, rx) = channel_entry(EventMask::READABLE);
        q.event_register(&entry);

        q.notify(EventMask::READABLE);
        q.notify(EventMask::READABLE);
        q.notify(EventMask::READABLE);

        assert!(rx.try_recv());
        assert!(!rx.try_recv());
        q.event_unregister(&entry);
        Ok(())
    }

    #[test]
    fn test_register_unregister_round_trip() -> Result<()> {
        let q = Queue::new();
        assert!(q.is_empty());

        let (entry, rx) = channel_entry(EventMask::READABLE);
        q.event_register(&entry);
        assert_eq!(q.len(), 1);

        q.event_unregister(&entry);
        assert!(q.is_empty());

        // Indistinguishable from never-registered: no further deliveries.
        q.notify(EventMask::READABLE);
        assert!(!rx.try_recv());
        Ok(())
    }

    #[test]
    fn test_unregister_unknown_entry_is_noop() -> Result<()> {
        let q = Queue::new();
        let (registered, _rx1) = channel_entry(EventMask::READABLE);
        let (stranger, _rx2) = channel_entry(EventMask::READABLE);
        q.event_register(&registered);

        q.event_unregister(&stranger);
        assert_eq!(q.len(), 1);

        q.event_unregister(&registered);
        assert!(q.is_empty());
        Ok(())
    }
}
