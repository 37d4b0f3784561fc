//! Seams to the platform, memory-management and namespace-filesystem
//! collaborators.
//!
//! The task core only needs narrow hooks from each of them; embedders supply
//! implementations through trait objects installed at task or namespace
//! creation.

/// Per-task platform execution context.
pub trait PlatformContext: Send + Sync {
    /// Called before the task goroutine sleeps, so the platform can
    /// relinquish any execution resources tied to the task.
    fn prepare_sleep(&self) {}

    /// Asks the platform to abandon user-mode execution so an interrupt
    /// posted from another thread is observed promptly.
    fn interrupt(&self);
}

/// Per-task address space activation.
///
/// The block core deactivates the address space for the duration of a sleep
/// and must leave it in its original activation state on every exit path.
pub trait AddressSpace: Send + Sync {
    fn activate(&self);
    fn deactivate(&self);
}

/// Handle to the filesystem inode representing a namespace.
///
/// Reference counting of the namespace is delegated to this inode.
pub trait NamespaceInode: Send + Sync {
    fn inc_ref(&self);
    fn dec_ref(&self);
}

/// Platform context for tasks with no user-mode execution to abandon
/// (kernel-internal tasks, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NopPlatform;

impl PlatformContext for NopPlatform {
    fn interrupt(&self) {}
}

/// Address space whose activation is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopAddressSpace;

impl AddressSpace for NopAddressSpace {
    fn activate(&self) {}
    fn deactivate(&self) {}
}
