use parking_lot::{Condvar, Mutex};

/// Counts outstanding work and lets callers wait for the count to drain to
/// zero. Used for running task goroutines and async I/O callbacks, whose
/// counts must be zero before any checkpoint-equivalent operation.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Decrements the count, waking waiters when it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics on an unbalanced call.
    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        *count = count
            .checked_sub(1)
            .expect("WaitGroup::done without matching add");
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until the count reaches zero. Returns immediately if it already
    /// is.
    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }
}
