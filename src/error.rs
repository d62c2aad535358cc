//! Errors returned by [`KeyedLock`](crate::KeyedLock).

use thiserror::Error;

/// Errors that can occur when acquiring a key.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The cancellation token fired before the key could be acquired.
    ///
    /// No state is left behind: the key is exactly as locked or unlocked as it would have been
    /// had the acquisition never been attempted.
    #[error("cancelled before the key was acquired")]
    Cancelled,
}
