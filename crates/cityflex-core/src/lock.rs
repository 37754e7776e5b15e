use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive claim on a district for the duration of one scheduling run.
#[derive(Debug, Default)]
pub struct RunLock {
    held: AtomicBool,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lock without waiting; `None` when another run holds it.
    pub fn try_acquire(&self) -> Option<RunGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RunGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Released on drop, whether the run committed or failed.
#[derive(Debug)]
pub struct RunGuard<'a> {
    lock: &'a RunLock,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
