//! Wait queue for [`Entry`](crate::entry::Entry) locks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering::{Acquire, Release};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicBool;
use std::task::{Context, Poll};
#[cfg(not(feature = "loom"))]
use std::thread::{Thread, current, park};

use futures::task::AtomicWaker;
#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicBool;
#[cfg(feature = "loom")]
use loom::thread::{Thread, current, park};

#[cfg(not(feature = "loom"))]
type Mutex<T> = parking_lot::Mutex<T>;
#[cfg(not(feature = "loom"))]
type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

#[cfg(feature = "loom")]
type Mutex<T> = loom::sync::Mutex<T>;
#[cfg(feature = "loom")]
type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

/// Unordered-fairness wait queue.
///
/// Signaling a [`Waiter`] only tells it that the lock was released; the waiter has to compete
/// for the lock again, and re-enqueue itself if another party got there first.
pub(crate) struct WaitQueue {
    /// Enqueued waiters, oldest first.
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

/// A party waiting for a lock to be released.
#[derive(Debug)]
pub(crate) struct Waiter {
    /// Set when the waiter has been dequeued by a releasing party.
    signaled: AtomicBool,
    /// How the waiter is notified.
    monitor: Monitor,
}

/// Monitors the signal.
enum Monitor {
    /// Monitors asynchronously.
    Async(AtomicWaker),
    /// Monitors synchronously.
    Sync(Thread),
}

impl WaitQueue {
    /// Pushes a waiter at the back of the queue.
    pub(crate) fn push(&self, waiter: &Arc<Waiter>) {
        debug_assert!(!waiter.is_signaled());
        self.waiters().push_back(waiter.clone());
    }

    /// Removes a waiter that has not been signaled.
    ///
    /// Returns `false` if the waiter was no longer in the queue, meaning that it has been
    /// signaled.
    pub(crate) fn remove(&self, waiter: &Arc<Waiter>) -> bool {
        let mut waiters = self.waiters();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            waiters.remove(pos);
            true
        } else {
            debug_assert!(waiter.is_signaled());
            false
        }
    }

    /// Dequeues and signals the oldest waiter.
    ///
    /// Returns `false` if there was no waiter.
    pub(crate) fn signal_one(&self) -> bool {
        let waiter = {
            let mut waiters = self.waiters();
            let Some(waiter) = waiters.pop_front() else {
                return false;
            };
            // Must be set before the queue is unlocked so that `remove` can rely on it.
            waiter.signaled.store(true, Release);
            waiter
        };
        waiter.wake();
        true
    }

    /// Returns the number of enqueued waiters.
    pub(crate) fn len(&self) -> usize {
        self.waiters().len()
    }

    #[cfg(not(feature = "loom"))]
    fn waiters(&self) -> MutexGuard<'_, VecDeque<Arc<Waiter>>> {
        self.waiters.lock()
    }

    #[cfg(feature = "loom")]
    fn waiters(&self) -> MutexGuard<'_, VecDeque<Arc<Waiter>>> {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Monitor::Async(_) => f.write_str("Async"),
            Monitor::Sync(_) => f.write_str("Sync"),
        }
    }
}

impl Waiter {
    /// Creates a new asynchronous [`Waiter`].
    pub(crate) fn new_async() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            monitor: Monitor::Async(AtomicWaker::new()),
        }
    }

    /// Creates a new [`Waiter`] for the current thread.
    pub(crate) fn new_sync() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            monitor: Monitor::Sync(current()),
        }
    }

    /// Returns `true` if the waiter has been signaled.
    pub(crate) fn is_signaled(&self) -> bool {
        self.signaled.load(Acquire)
    }

    /// Polls the signal, asynchronously.
    ///
    /// The waker is installed before the signal is checked, therefore a signal sent in between
    /// is never lost.
    pub(crate) fn poll_signal(&self, cx: &Context<'_>) -> Poll<()> {
        self.register(cx);
        if self.is_signaled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Installs the waker of the task to notify.
    pub(crate) fn register(&self, cx: &Context<'_>) {
        let Monitor::Async(waker) = &self.monitor else {
            unreachable!("a synchronous waiter cannot be polled");
        };
        waker.register(cx.waker());
    }

    /// Blocks the current thread until the waiter is signaled.
    pub(crate) fn wait_sync(&self) {
        debug_assert!(matches!(self.monitor, Monitor::Sync(_)));
        // `park` may return spuriously.
        while !self.is_signaled() {
            park();
        }
    }

    fn wake(&self) {
        match &self.monitor {
            Monitor::Async(waker) => waker.wake(),
            Monitor::Sync(thread) => thread.unpark(),
        }
    }
}
