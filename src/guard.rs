//! [`Guard`] releases a key acquired from a [`KeyedLock`](crate::KeyedLock) when dropped.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::AcqRel;

use tracing::trace;

use crate::entry::Entry;
use crate::keyed_lock::Registry;

/// [`Guard`] proves exclusive ownership of a key until it is released or dropped.
///
/// A [`Guard`] owns a handle to the registry it came from, so it can be moved across tasks and
/// threads, and outlive the [`KeyedLock`](crate::KeyedLock) it was acquired from.
///
/// A [`Guard`] that is not bound to a variable releases the key right away:
///
/// ```compile_fail
/// #![deny(unused_must_use)]
/// use keylock::KeyedLock;
///
/// let lock: KeyedLock<u32> = KeyedLock::new();
/// lock.lock_sync(1);
/// ```
#[must_use = "if unused the key is released immediately"]
pub struct Guard<K: Eq + Hash> {
    /// The registry the entry belongs to.
    registry: Arc<Registry<K>>,
    /// The acquired key.
    key: K,
    /// The per-key lock.
    entry: Arc<Entry>,
    /// `false` while the guard only reserves the entry.
    locked: bool,
    /// Set by the first call to [`Guard::release`].
    released: AtomicBool,
}

impl<K: Eq + Hash> Guard<K> {
    /// Creates a [`Guard`] that holds a reference to `entry` without having acquired it.
    pub(crate) fn reserved(registry: Arc<Registry<K>>, key: K, entry: Arc<Entry>) -> Self {
        Self {
            registry,
            key,
            entry,
            locked: false,
            released: AtomicBool::new(false),
        }
    }

    /// Returns the entry of the key.
    pub(crate) fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Marks the entry as acquired by this guard.
    pub(crate) fn grant(mut self) -> Self {
        debug_assert!(!self.locked);
        self.locked = true;
        self
    }

    /// Returns a reference to the acquired key.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<&str> = KeyedLock::new();
    /// let guard = lock.lock_sync("order-123");
    /// assert_eq!(*guard.key(), "order-123");
    /// ```
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Releases the key before the [`Guard`] is dropped.
    ///
    /// Returns `true` if this call released the key, and `false` if it had already been released.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u64> = KeyedLock::new();
    ///
    /// let guard = lock.lock_sync(1);
    /// assert!(lock.is_locked(&1));
    ///
    /// assert!(guard.release());
    /// assert!(!guard.release());
    /// assert!(!lock.is_locked(&1));
    /// assert!(lock.is_empty());
    /// ```
    pub fn release(&self) -> bool {
        if self.released.swap(true, AcqRel) {
            return false;
        }
        let idle = if self.locked {
            self.entry.release()
        } else {
            trace!("dropping an unused reservation");
            self.entry.unreserve()
        };
        if idle {
            self.registry.reclaim(&self.key, &self.entry);
        }
        true
    }
}

impl<K: Eq + Hash> Drop for Guard<K> {
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for Guard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("key", &self.key)
            .field("locked", &self.locked)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
