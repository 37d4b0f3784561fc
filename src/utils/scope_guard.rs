/// Runs a closure when the scope is exited, whether by a normal return, an
/// early return, or a panic.
///
/// The block core relies on this to restore address-space activation and
/// run-state accounting on every exit path of a wait.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Wrapped in an Option so drop can take it, ensuring the closure runs at
    // most once even if it panics.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
