//! [`KeyedLock`] grants exclusive access per key to synchronous and asynchronous callers.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::{Config, DefaultConfig};
use crate::entry::Entry;
use crate::error::Error;
use crate::guard::Guard;

/// [`KeyedLock`] grants exclusive access per key to synchronous and asynchronous callers.
///
/// A per-key lock only exists while the key is held or waited for; it is reclaimed as soon as the
/// last party releases or stops waiting for it. Acquisitions of different keys never block each
/// other, and acquisitions of the same key are granted in no particular order.
///
/// Acquiring a key that the caller already holds deadlocks.
///
/// Cloning a [`KeyedLock`] returns another handle to the same set of keys.
pub struct KeyedLock<K, C = DefaultConfig> {
    /// Live per-key locks.
    registry: Arc<Registry<K>>,
    /// [`KeyedLock`] is configured statically.
    _config: PhantomData<fn() -> C>,
}

/// Key to [`Entry`] mapping shared by a [`KeyedLock`] and its guards.
///
/// Entries are only ever inserted together with a reference, and only ever removed together with
/// being tombstoned, each under the write lock of the map shard.
pub(crate) struct Registry<K> {
    entries: DashMap<K, Arc<Entry>>,
}

impl<K: Eq + Hash + Clone, C: Config> KeyedLock<K, C> {
    /// Creates an empty [`KeyedLock`].
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<String> = KeyedLock::new();
    /// assert!(lock.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(C::initial_capacity())
    }

    /// Creates an empty [`KeyedLock`] that can track `capacity` keys without reallocating.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u32> = KeyedLock::with_capacity(64);
    /// assert_eq!(lock.len(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                entries: DashMap::with_capacity(capacity),
            }),
            _config: PhantomData,
        }
    }

    /// Returns the number of keys that are currently held or waited for.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u32> = KeyedLock::new();
    ///
    /// let first = lock.lock_sync(1);
    /// let second = lock.lock_sync(2);
    /// assert_eq!(lock.len(), 2);
    ///
    /// drop(first);
    /// assert_eq!(lock.len(), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.entries.len()
    }

    /// Returns `true` if no key is held or waited for.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u32> = KeyedLock::new();
    /// assert!(lock.is_empty());
    ///
    /// let guard = lock.lock_sync(1);
    /// assert!(!lock.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.entries.is_empty()
    }

    /// Returns `true` if the key is held or waited for.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<String> = KeyedLock::new();
    ///
    /// let guard = lock.lock_sync("user-42".to_string());
    /// assert!(lock.contains_key("user-42"));
    /// assert!(!lock.contains_key("user-43"));
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.registry.entries.contains_key(key)
    }

    /// Returns `true` if the key is currently held.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u32> = KeyedLock::new();
    /// assert!(!lock.is_locked(&1));
    ///
    /// let guard = lock.lock_sync(1);
    /// assert!(lock.is_locked(&1));
    /// assert!(!lock.is_locked(&2));
    /// ```
    #[inline]
    pub fn is_locked<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.registry
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_locked(Acquire))
    }

    /// Acquires the key asynchronously.
    ///
    /// Dropping the returned future before it completes abandons the acquisition without side
    /// effects.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<u64> = KeyedLock::new();
    ///
    /// async {
    ///     let guard = lock.lock_async(123).await;
    ///     assert!(lock.is_locked(&123));
    ///     drop(guard);
    ///     assert!(lock.is_empty());
    /// };
    /// ```
    pub async fn lock_async(&self, key: K) -> Guard<K> {
        let guard = self.registry.reserve(key);
        guard.entry().lock_async().await;
        guard.grant()
    }

    /// Acquires the key asynchronously unless `token` is cancelled first.
    ///
    /// Returns [`Error::Cancelled`] if `token` had already been cancelled, or was cancelled before
    /// the key was acquired. Cancelling `token` after the key was acquired has no effect on the
    /// returned [`Guard`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `token` fires before the key is acquired.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::{CancellationToken, Error, KeyedLock};
    ///
    /// let lock: KeyedLock<u64> = KeyedLock::new();
    /// let token = CancellationToken::new();
    ///
    /// async {
    ///     let guard = lock.lock_async_with_cancel(7, &token).await.unwrap();
    ///     token.cancel();
    ///     assert!(lock.is_locked(&7));
    ///     drop(guard);
    ///
    ///     assert_eq!(lock.lock_async_with_cancel(7, &token).await.err(), Some(Error::Cancelled));
    /// };
    /// ```
    pub async fn lock_async_with_cancel(
        &self,
        key: K,
        token: &CancellationToken,
    ) -> Result<Guard<K>, Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            () = token.cancelled() => {
                trace!("lock acquisition cancelled");
                Err(Error::Cancelled)
            }
            guard = self.lock_async(key) => Ok(guard),
        }
    }

    /// Acquires the key synchronously, blocking the current thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<&str> = KeyedLock::new();
    ///
    /// let guard = lock.lock_sync("invoice");
    /// assert!(lock.try_lock("invoice").is_none());
    /// ```
    pub fn lock_sync(&self, key: K) -> Guard<K> {
        let guard = self.registry.reserve(key);
        guard.entry().lock_sync::<C>();
        guard.grant()
    }

    /// Tries to acquire the key without waiting.
    ///
    /// Returns `None` if the key is held.
    ///
    /// # Examples
    ///
    /// ```
    /// use keylock::KeyedLock;
    ///
    /// let lock: KeyedLock<&str> = KeyedLock::new();
    ///
    /// let guard = lock.try_lock("invoice");
    /// assert!(guard.is_some());
    /// assert!(lock.try_lock("invoice").is_none());
    ///
    /// drop(guard);
    /// assert!(lock.try_lock("invoice").is_some());
    /// assert!(lock.is_empty());
    /// ```
    pub fn try_lock(&self, key: K) -> Option<Guard<K>> {
        let guard = self.registry.reserve(key);
        guard.entry().try_lock().then(|| guard.grant())
    }

    /// Returns the number of parties holding or waiting for the key.
    #[cfg(test)]
    pub(crate) fn ref_count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.registry
            .entries
            .get(key)
            .map_or(0, |entry| entry.ref_count(Acquire))
    }

    /// Returns the entry currently mapped to the key.
    #[cfg(test)]
    pub(crate) fn mapped_entry<Q>(&self, key: &Q) -> Option<Arc<Entry>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.registry
            .entries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Maps the key to `entry` regardless of the state of either.
    #[cfg(test)]
    pub(crate) fn map_entry(&self, key: K, entry: Arc<Entry>) {
        self.registry.entries.insert(key, entry);
    }
}

impl<K: Eq + Hash + Clone> Registry<K> {
    /// Returns a [`Guard`] holding a reference to the live entry of the key.
    ///
    /// The reference is taken while the map shard is locked, so the entry cannot be reclaimed in
    /// between.
    fn reserve(self: &Arc<Self>, key: K) -> Guard<K> {
        let reserved = self
            .entries
            .get(&key)
            .and_then(|entry| entry.try_reserve().then(|| Arc::clone(entry.value())));
        let entry = match reserved {
            Some(entry) => entry,
            None => self.insert_or_reserve(key.clone()),
        };
        Guard::reserved(Arc::clone(self), key, entry)
    }

    /// Reserves the entry of the key, or replaces it with a new one, under the shard write lock.
    fn insert_or_reserve(&self, key: K) -> Arc<Entry> {
        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().try_reserve() {
                    return Arc::clone(occupied.get());
                }
                trace!("replacing a tombstoned entry");
                let entry = Arc::new(Entry::reserved());
                occupied.insert(Arc::clone(&entry));
                entry
            }
            MapEntry::Vacant(vacant) => {
                trace!("creating an entry");
                let entry = Arc::new(Entry::reserved());
                vacant.insert(Arc::clone(&entry));
                entry
            }
        }
    }
}

impl<K: Eq + Hash> Registry<K> {
    /// Removes the entry if it is still the one mapped to the key, and is unlocked and
    /// unreferenced.
    pub(crate) fn reclaim(&self, key: &K, entry: &Arc<Entry>) {
        let removed = self.entries.remove_if(key, |_, current| {
            Arc::ptr_eq(current, entry) && current.try_remove()
        });
        if removed.is_some() {
            trace!("reclaimed an idle entry");
        } else {
            trace!("entry reused before it could be reclaimed");
        }
    }
}

impl<K, C> Clone for KeyedLock<K, C> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            _config: PhantomData,
        }
    }
}

impl<K: Eq + Hash + Clone, C: Config> Default for KeyedLock<K, C> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, C> fmt::Debug for KeyedLock<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locked = self
            .registry
            .entries
            .iter()
            .filter(|entry| entry.is_locked(Relaxed))
            .count();
        f.debug_struct("KeyedLock")
            .field("len", &self.registry.entries.len())
            .field("locked", &locked)
            .finish()
    }
}
