//! Opaque user-namespace handle.
//!
//! Credentials and capability checks live with the outer system; the task
//! core only threads the authority reference through PID-namespace creation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct UserNamespace {
    id: u64,
}

impl UserNamespace {
    pub fn new_root() -> Arc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
