//! [`Entry`] is the per-key lock handed out by [`KeyedLock`](crate::KeyedLock).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{self, AcqRel, Acquire, Relaxed};
use std::task::{Context, Poll};

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;

use crate::config::Config;
use crate::wait_queue::{WaitQueue, Waiter};

/// [`Entry`] combines a binary lock with the number of parties referencing it.
///
/// The lock bit, the tombstone bit and the reference count share a single word, so that unlocking
/// and dropping a reference happen in one atomic step, and a reclaimer can check that the entry is
/// idle and tombstone it in another.
pub(crate) struct Entry {
    /// [`Entry`] state.
    state: AtomicUsize,
    /// Parties waiting for the lock to be released.
    wait_queue: WaitQueue,
}

/// Future acquiring the lock of an [`Entry`].
///
/// Dropping it before completion withdraws from the wait queue without affecting the lock.
#[derive(Debug)]
pub(crate) struct LockAsync<'e> {
    entry: &'e Entry,
    waiter: Option<Arc<Waiter>>,
}

impl Entry {
    /// The lock is held.
    const LOCKED: usize = 1;

    /// The entry has been evicted from the registry.
    const REMOVED: usize = 1 << 1;

    /// Bit offset of the reference count.
    const REF_SHIFT: u32 = 2;

    /// A single reference.
    const REF_UNIT: usize = 1 << Self::REF_SHIFT;

    /// Creates a new unlocked [`Entry`] referenced once by its creator.
    pub(crate) fn reserved() -> Self {
        Self {
            state: AtomicUsize::new(Self::REF_UNIT),
            wait_queue: WaitQueue::default(),
        }
    }

    /// Returns the number of parties holding or waiting for the lock.
    #[cfg(test)]
    pub(crate) fn ref_count(&self, mo: Ordering) -> usize {
        self.state.load(mo) >> Self::REF_SHIFT
    }

    /// Returns `true` if the lock is held.
    pub(crate) fn is_locked(&self, mo: Ordering) -> bool {
        self.state.load(mo) & Self::LOCKED == Self::LOCKED
    }

    /// Returns `true` if the entry has been tombstoned.
    #[cfg(test)]
    pub(crate) fn is_removed(&self, mo: Ordering) -> bool {
        self.state.load(mo) & Self::REMOVED == Self::REMOVED
    }

    /// Returns the number of parties parked in the wait queue.
    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.wait_queue.len()
    }

    /// Adds a reference unless the entry has been tombstoned.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .fetch_update(AcqRel, Acquire, |state| {
                if state & Self::REMOVED == Self::REMOVED {
                    None
                } else {
                    Some(state + Self::REF_UNIT)
                }
            })
            .is_ok()
    }

    /// Drops a reference taken without acquiring the lock.
    ///
    /// Returns `true` if nothing references the entry anymore.
    ///
    /// # Panics
    ///
    /// Panics if the reference count is already zero.
    pub(crate) fn unreserve(&self) -> bool {
        self.drop_reference(false) == 0
    }

    /// Tries to acquire the lock.
    pub(crate) fn try_lock(&self) -> bool {
        self.state.load(Relaxed) & Self::LOCKED == 0
            && self.state.fetch_or(Self::LOCKED, Acquire) & Self::LOCKED == 0
    }

    /// Acquires the lock synchronously.
    pub(crate) fn lock_sync<C: Config>(&self) {
        let mut spin_count = 0;
        loop {
            if self.try_lock() {
                return;
            }
            if spin_count < C::spin_count() {
                spin_count += 1;
                C::backoff(spin_count);
                continue;
            }

            let waiter = Arc::new(Waiter::new_sync());
            self.wait_queue.push(&waiter);
            if self.try_lock() {
                // A signal that raced with this is meant for the lock that was just acquired.
                self.wait_queue.remove(&waiter);
                return;
            }
            waiter.wait_sync();
        }
    }

    /// Acquires the lock asynchronously.
    pub(crate) fn lock_async(&self) -> LockAsync<'_> {
        LockAsync {
            entry: self,
            waiter: None,
        }
    }

    /// Releases the lock and drops the reference of the holder, then signals a waiter.
    ///
    /// Returns `true` if nothing references the entry anymore.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held or the reference count is already zero.
    pub(crate) fn release(&self) -> bool {
        let remaining = self.drop_reference(true);
        if remaining == 0 {
            // Every waiter holds a reference.
            debug_assert_eq!(self.wait_queue.len(), 0);
            return true;
        }
        self.wait_queue.signal_one();
        false
    }

    /// Tombstones the entry if it is unlocked and unreferenced.
    pub(crate) fn try_remove(&self) -> bool {
        self.state
            .compare_exchange(0, Self::REMOVED, AcqRel, Relaxed)
            .is_ok()
    }

    /// Drops a reference, and the lock if `unlock` is `true`, returning the remaining references.
    fn drop_reference(&self, unlock: bool) -> usize {
        let released = if unlock {
            Self::LOCKED + Self::REF_UNIT
        } else {
            Self::REF_UNIT
        };
        match self.state.fetch_update(AcqRel, Acquire, |state| {
            let referenced = state >> Self::REF_SHIFT != 0;
            let locked = state & Self::LOCKED == Self::LOCKED;
            (referenced && (locked || !unlock)).then(|| state - released)
        }) {
            Ok(state) => (state - released) >> Self::REF_SHIFT,
            Err(state) if unlock => panic!(
                "keylock invariant violated: released an entry that was not held (state: {state:#x})"
            ),
            Err(state) => panic!(
                "keylock invariant violated: entry reference count dropped below zero (state: {state:#x})"
            ),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("Entry")
            .field("state", &state)
            .field("locked", &(state & Self::LOCKED == Self::LOCKED))
            .field("removed", &(state & Self::REMOVED == Self::REMOVED))
            .field("ref_count", &(state >> Self::REF_SHIFT))
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl Future for LockAsync<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(waiter) = this.waiter.as_ref() {
                if waiter.poll_signal(cx).is_pending() {
                    return Poll::Pending;
                }
                this.waiter.take();
            }

            if this.entry.try_lock() {
                return Poll::Ready(());
            }

            let waiter = Arc::new(Waiter::new_async());
            // Registered before being pushed so that an early signal still wakes the task.
            waiter.register(cx);
            this.entry.wait_queue.push(&waiter);
            if this.entry.try_lock() {
                this.entry.wait_queue.remove(&waiter);
                return Poll::Ready(());
            }
            this.waiter.replace(waiter);
        }
    }
}

impl Drop for LockAsync<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !self.entry.wait_queue.remove(&waiter) {
                // The signal was received but never acted upon: hand it over to the next waiter.
                self.entry.wait_queue.signal_one();
            }
        }
    }
}
