//! [`FairRwLock`] is a fair, future-based read-write lock.

#![deny(unsafe_code)]

use std::fmt;
use std::sync::Arc;
#[cfg(not(feature = "loom"))]
use std::sync::Mutex;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{self, Acquire, Relaxed};

#[cfg(feature = "loom")]
use loom::sync::Mutex;
#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;

use crate::deferred::Deferred;
use crate::opcode::Opcode;
use crate::sync_primitive::SyncPrimitive;
use crate::token::{ReadLockToken, WriteLockToken};
use crate::wait_queue::{Entry, WaitQueue, complete_grants};

/// [`FairRwLock`] is a fair, future-based read-write lock.
///
/// Acquiring the lock never blocks: [`acquire_read`](Self::acquire_read) and
/// [`acquire_write`](Self::acquire_write) return a [`Deferred`] token that is already complete if
/// the lock was granted immediately, and is otherwise completed by the release that hands the
/// lock over. Requests are granted strictly in arrival order, except that read requests queued
/// back-to-back are granted together. A reader never overtakes a waiting writer, and a writer
/// never overtakes a waiting reader.
///
/// [`FairRwLock`] is a handle to shared lock state; cloning it yields another handle to the same
/// lock.
#[derive(Clone)]
pub struct FairRwLock {
    /// Shared lock state.
    inner: Arc<Inner>,
}

/// Lock state shared by all the handles and tokens.
struct Inner {
    /// Owner state and wait queue flag.
    state: AtomicUsize,
    /// Pending requests.
    wait_queue: Mutex<WaitQueue>,
}

impl FairRwLock {
    /// Maximum number of shared owners.
    ///
    /// Read requests exceeding the limit are queued.
    pub const MAX_SHARED_OWNERS: usize = WaitQueue::DATA_MASK - 1;

    /// Creates a new free [`FairRwLock`].
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// assert!(lock.is_idle(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicUsize::new(0),
                wait_queue: Mutex::new(WaitQueue::default()),
            }),
        }
    }

    /// Returns `true` if the lock is currently not held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// assert!(lock.is_free(Relaxed));
    ///
    /// let token = lock.try_read().unwrap();
    /// assert!(!lock.is_free(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn is_free(&self, mo: Ordering) -> bool {
        (self.inner.state.load(mo) & WaitQueue::DATA_MASK) == 0
    }

    /// Returns `true` if the write lock is currently held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// assert!(!lock.is_locked(Relaxed));
    ///
    /// let token = lock.try_write().unwrap();
    /// assert!(lock.is_locked(Relaxed));
    /// assert!(!lock.is_shared(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn is_locked(&self, mo: Ordering) -> bool {
        (self.inner.state.load(mo) & WaitQueue::DATA_MASK) == WaitQueue::DATA_MASK
    }

    /// Returns `true` if the read lock is currently held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// assert!(!lock.is_shared(Relaxed));
    ///
    /// let token = lock.try_read().unwrap();
    /// assert!(lock.is_shared(Relaxed));
    /// assert!(!lock.is_locked(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn is_shared(&self, mo: Ordering) -> bool {
        let share_state = self.inner.state.load(mo) & WaitQueue::DATA_MASK;
        share_state != 0 && share_state != WaitQueue::DATA_MASK
    }

    /// Returns `true` if there are pending requests.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// let writer = lock.acquire_write();
    /// assert!(!lock.has_waiters(Relaxed));
    ///
    /// let reader = lock.acquire_read();
    /// assert!(lock.has_waiters(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn has_waiters(&self, mo: Ordering) -> bool {
        (self.inner.state.load(mo) & WaitQueue::QUEUED_FLAG) == WaitQueue::QUEUED_FLAG
    }

    /// Returns `true` if the lock is not held and there are no pending requests.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    /// let token = lock.acquire_read().wait();
    /// assert!(!lock.is_idle(Relaxed));
    ///
    /// token.release();
    /// assert!(lock.is_idle(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn is_idle(&self, mo: Ordering) -> bool {
        self.inner.state.load(mo) == 0
    }

    /// Returns `true` if both handles refer to the same lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    /// assert!(lock.ptr_eq(&lock.clone()));
    /// assert!(!lock.ptr_eq(&FairRwLock::new()));
    /// ```
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Acquires the read lock.
    ///
    /// The returned [`Deferred`] is already complete if the write lock is not held and no request
    /// is waiting; otherwise, it completes once all earlier requests have been granted and the
    /// lock is no longer held by a writer.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    ///
    /// async {
    ///     let token = lock.acquire_read().await;
    ///     assert!(lock.is_shared(Relaxed));
    ///     token.release();
    /// };
    ///
    /// let first = lock.acquire_read();
    /// let second = lock.acquire_read();
    /// assert!(first.is_done() && second.is_done());
    /// ```
    #[inline]
    pub fn acquire_read(&self) -> Deferred<ReadLockToken> {
        if self.try_acquire_internal(Opcode::Shared) {
            return Deferred::ready(ReadLockToken::new(self.clone()));
        }
        let (deferred, completer) = Deferred::pending();
        if let Some(entry) = self.wait_resources(Entry::Shared(completer)) {
            entry.grant(self);
        }
        deferred
    }

    /// Acquires the write lock.
    ///
    /// The returned [`Deferred`] is already complete if the lock is not held and no request is
    /// waiting; otherwise, it completes once all earlier requests have been granted and released.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = FairRwLock::new();
    ///
    /// async {
    ///     let token = lock.acquire_write().await;
    ///     assert!(lock.is_locked(Relaxed));
    ///     token.release();
    /// };
    ///
    /// let writer = lock.acquire_write();
    /// let reader = lock.acquire_read();
    /// assert!(writer.is_done() && !reader.is_done());
    /// ```
    #[inline]
    pub fn acquire_write(&self) -> Deferred<WriteLockToken> {
        if self.try_acquire_internal(Opcode::Exclusive) {
            return Deferred::ready(WriteLockToken::new(self.clone()));
        }
        let (deferred, completer) = Deferred::pending();
        if let Some(entry) = self.wait_resources(Entry::Exclusive(completer)) {
            entry.grant(self);
        }
        deferred
    }

    /// Tries to acquire the read lock.
    ///
    /// Returns `None` if the write lock is held or a request is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    ///
    /// let reader = lock.try_read().unwrap();
    /// let writer = lock.acquire_write();
    /// assert!(lock.try_read().is_none());
    /// ```
    #[inline]
    #[must_use]
    pub fn try_read(&self) -> Option<ReadLockToken> {
        self.try_acquire_internal(Opcode::Shared)
            .then(|| ReadLockToken::new(self.clone()))
    }

    /// Tries to acquire the write lock.
    ///
    /// Returns `None` if the lock is held or a request is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    ///
    /// let writer = lock.try_write().unwrap();
    /// assert!(lock.try_write().is_none());
    /// assert!(lock.try_read().is_none());
    ///
    /// writer.release();
    /// assert!(lock.try_write().is_some());
    /// ```
    #[inline]
    #[must_use]
    pub fn try_write(&self) -> Option<WriteLockToken> {
        self.try_acquire_internal(Opcode::Exclusive)
            .then(|| WriteLockToken::new(self.clone()))
    }

    /// Tries to acquire the resource without waiting.
    fn try_acquire_internal(&self, mode: Opcode) -> bool {
        let mut state = self.inner.state.load(Relaxed);
        while mode.can_acquire(state) {
            match self.inner.state.compare_exchange(
                state,
                state + mode.release_count(),
                Acquire,
                Relaxed,
            ) {
                Ok(_) => return true,
                Err(new_state) => state = new_state,
            }
        }
        false
    }
}

impl Default for FairRwLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FairRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.load(Relaxed);
        let owner_state = state & WaitQueue::DATA_MASK;
        let locked = owner_state == WaitQueue::DATA_MASK;
        let share_count = if locked { 0 } else { owner_state };
        let has_waiters = state & WaitQueue::QUEUED_FLAG == WaitQueue::QUEUED_FLAG;
        f.debug_struct("FairRwLock")
            .field("state", &state)
            .field("locked", &locked)
            .field("share_count", &share_count)
            .field("has_waiters", &has_waiters)
            .finish()
    }
}

impl SyncPrimitive for FairRwLock {
    #[inline]
    fn state(&self) -> &AtomicUsize {
        &self.inner.state
    }

    #[inline]
    fn wait_queue_mutex(&self) -> &Mutex<WaitQueue> {
        &self.inner.wait_queue
    }

    #[inline]
    fn grant(&self, granted: Vec<Entry>) {
        complete_grants(self, granted);
    }
}
