//! [`Config`] defines configuration options for [`KeyedLock`](crate::KeyedLock).

use std::fmt;
use std::hint::spin_loop;
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

#[cfg(feature = "loom")]
use loom::thread::yield_now;

/// [`Config`] defines configuration options for [`KeyedLock`](crate::KeyedLock).
///
/// Implementations are usually zero-sized types overriding a subset of the default methods.
///
/// # Examples
///
/// ```
/// use keylock::{Config, KeyedLock};
///
/// #[derive(Debug, Default)]
/// struct Eager;
///
/// impl Config for Eager {
///     fn spin_count() -> usize {
///         0
///     }
///
///     fn initial_capacity() -> usize {
///         1024
///     }
/// }
///
/// let lock: KeyedLock<u64, Eager> = KeyedLock::new();
/// drop(lock.lock_sync(7));
/// assert!(lock.is_empty());
/// ```
pub trait Config: fmt::Debug + Default {
    /// Defines the number of times a synchronous acquisition spins before parking the thread.
    #[inline]
    #[must_use]
    fn spin_count() -> usize {
        128
    }

    /// Defines the backoff function to use when spinning.
    #[inline]
    fn backoff(spin_count: usize) {
        if spin_count % 32 == 0 {
            yield_now();
        } else {
            spin_loop();
        }
    }

    /// Defines the number of keys the registry can hold without reallocating.
    #[inline]
    #[must_use]
    fn initial_capacity() -> usize {
        0
    }
}

/// Default configuration for [`KeyedLock`](crate::KeyedLock).
#[derive(Debug, Default)]
pub struct DefaultConfig;

impl Config for DefaultConfig {}
