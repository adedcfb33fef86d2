//! Errors returned by lock tokens.

use thiserror::Error;

/// Errors that can occur when releasing a lock.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The hash of a [`NamedRwLock`](crate::NamedRwLock) key changed between acquisition and
    /// release.
    ///
    /// The registry can no longer locate the lock record reliably, so the lock was left held and
    /// the registry was not modified.
    #[error("the lock key was modified while the lock was held")]
    ConcurrentKeyModification,
}
