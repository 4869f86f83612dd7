//! Reentrancy lock for upload cycles.

use std::sync::atomic::{AtomicU64, Ordering};

/// Single-holder lock for processing cycles, released by a drop guard.
///
/// Each acquisition gets its own token, so a guard only ever clears a hold
/// it still owns. [`CycleLock::interrupt`] releases the current holder and
/// bumps the stop epoch that running cycles poll.
#[derive(Debug, Default)]
pub(crate) struct CycleLock {
    /// Token of the holding cycle, 0 when free
    owner: AtomicU64,
    next_token: AtomicU64,
    epoch: AtomicU64,
}

impl CycleLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or `None` if another cycle holds it
    pub(crate) fn acquire(&self) -> Option<CycleGuard<'_>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        // Read after winning so an interrupt before the swap is not mistaken
        // for one aimed at this cycle
        let epoch = self.epoch.load(Ordering::Acquire);
        Some(CycleGuard {
            lock: self,
            token,
            epoch,
        })
    }

    pub(crate) fn is_held(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Ask the running cycle to stop and free the lock for the next one
    pub(crate) fn interrupt(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.owner.store(0, Ordering::Release);
    }
}

/// Held for the duration of one cycle
pub(crate) struct CycleGuard<'a> {
    lock: &'a CycleLock,
    token: u64,
    epoch: u64,
}

impl CycleGuard<'_> {
    pub(crate) fn stop_requested(&self) -> bool {
        self.lock.epoch.load(Ordering::Acquire) != self.epoch
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        // No-op if an interrupt already handed the lock on
        let _ = self.lock.owner.compare_exchange(
            self.token,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
