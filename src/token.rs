//! Lock tokens granted by [`FairRwLock`].

#![deny(unsafe_code)]

use std::fmt;

use crate::lock::FairRwLock;
use crate::opcode::Opcode;
use crate::sync_primitive::SyncPrimitive;

/// Shared ownership of a [`FairRwLock`].
///
/// The read lock is released by [`release`](Self::release) or when the token is dropped.
#[must_use = "dropping a `ReadLockToken` releases the read lock"]
pub struct ReadLockToken {
    /// The lock that granted the token.
    lock: FairRwLock,
    /// `false` once the read lock has been released or handed over.
    armed: bool,
}

/// Exclusive ownership of a [`FairRwLock`].
///
/// The write lock is released by [`release`](Self::release) or when the token is dropped.
#[must_use = "dropping a `WriteLockToken` releases the write lock"]
pub struct WriteLockToken {
    /// The lock that granted the token.
    lock: FairRwLock,
    /// `false` once the write lock has been released or handed over.
    armed: bool,
}

impl ReadLockToken {
    pub(crate) fn new(lock: FairRwLock) -> Self {
        Self { lock, armed: true }
    }

    /// Returns the lock that granted the token.
    #[inline]
    #[must_use]
    pub fn lock(&self) -> &FairRwLock {
        &self.lock
    }

    /// Releases the read lock.
    ///
    /// Waiting requests that inherit the lock are completed on the current thread before this
    /// method returns, or, if called from a continuation, once the continuation returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    /// let reader = lock.acquire_read().wait();
    /// let writer = lock.acquire_write();
    ///
    /// reader.release();
    /// assert!(writer.is_done());
    /// ```
    #[inline]
    pub fn release(mut self) {
        self.release_internal();
    }

    /// Gives up the token without releasing the read lock.
    pub(crate) fn disarm(mut self) -> FairRwLock {
        self.armed = false;
        self.lock.clone()
    }

    fn release_internal(&mut self) {
        if self.armed {
            self.armed = false;
            let released = self.lock.release_loop(Opcode::Shared);
            debug_assert!(released);
        }
    }
}

impl WriteLockToken {
    pub(crate) fn new(lock: FairRwLock) -> Self {
        Self { lock, armed: true }
    }

    /// Returns the lock that granted the token.
    #[inline]
    #[must_use]
    pub fn lock(&self) -> &FairRwLock {
        &self.lock
    }

    /// Releases the write lock.
    ///
    /// Waiting requests that inherit the lock are completed on the current thread before this
    /// method returns, or, if called from a continuation, once the continuation returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::{FairRwLock, join_all};
    ///
    /// let lock = FairRwLock::new();
    /// let writer = lock.acquire_write().wait();
    /// let readers = join_all([lock.acquire_read(), lock.acquire_read()]);
    ///
    /// writer.release();
    /// assert!(readers.is_done());
    /// ```
    #[inline]
    pub fn release(mut self) {
        self.release_internal();
    }

    /// Gives up the token without releasing the write lock.
    pub(crate) fn disarm(mut self) -> FairRwLock {
        self.armed = false;
        self.lock.clone()
    }

    fn release_internal(&mut self) {
        if self.armed {
            self.armed = false;
            let released = self.lock.release_loop(Opcode::Exclusive);
            debug_assert!(released);
        }
    }
}

impl fmt::Debug for ReadLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadLockToken")
            .field("lock", &self.lock)
            .field("armed", &self.armed)
            .finish()
    }
}

impl fmt::Debug for WriteLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLockToken")
            .field("lock", &self.lock)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for ReadLockToken {
    #[inline]
    fn drop(&mut self) {
        self.release_internal();
    }
}

impl Drop for WriteLockToken {
    #[inline]
    fn drop(&mut self) {
        self.release_internal();
    }
}
