//! [`NamedRwLock`] multiplexes independent [`FairRwLock`] instances by key.

#![deny(unsafe_code)]

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::sync::atomic::Ordering::Acquire;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, trace};

use crate::deferred::Deferred;
use crate::error::Error;
use crate::lock::FairRwLock;
use crate::token::{ReadLockToken, WriteLockToken};

/// [`NamedRwLock`] multiplexes independent [`FairRwLock`] instances by key.
///
/// Acquisitions of equal keys contend for the same lock, and acquisitions of different keys never
/// interfere. The lock of a key is created on first use and removed as soon as it is neither held
/// nor awaited. Each key is served fairly as described in [`FairRwLock`]; there is no ordering
/// across keys.
///
/// The hash of a key must not change between acquisition and release, otherwise the release
/// fails with [`Error::ConcurrentKeyModification`].
///
/// [`NamedRwLock`] is a handle to a shared registry; cloning it yields another handle to the same
/// registry, while registries created separately are fully independent.
pub struct NamedRwLock<K, S = RandomState>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Locks in use.
    locks: Arc<DashMap<K, FairRwLock, S>>,
}

/// Shared ownership of a key in a [`NamedRwLock`].
///
/// The read lock is released by [`release`](Self::release) or when the token is dropped.
#[must_use = "dropping a `NamedReadLockToken` releases the read lock"]
pub struct NamedReadLockToken<K, S = RandomState>(Hold<K, S>)
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone;

/// Exclusive ownership of a key in a [`NamedRwLock`].
///
/// The write lock is released by [`release`](Self::release) or when the token is dropped.
#[must_use = "dropping a `NamedWriteLockToken` releases the write lock"]
pub struct NamedWriteLockToken<K, S = RandomState>(Hold<K, S>)
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone;

/// A held key and its registry.
struct Hold<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Token of the per-key lock, `None` once released.
    holding: Option<Holding>,
    /// The registry the key was acquired from.
    registry: NamedRwLock<K, S>,
    /// The key.
    key: K,
    /// Hash of the key at acquisition.
    hash: u64,
}

/// Token of a per-key lock.
enum Holding {
    Shared(ReadLockToken),
    Exclusive(WriteLockToken),
}

impl<K, S> NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    /// Creates an empty [`NamedRwLock`].
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<String> = NamedRwLock::new();
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }

    /// Creates an empty [`NamedRwLock`] whose record map is split into `shard_amount` shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_amount` is not a power of two greater than one.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<u64> = NamedRwLock::with_shard_amount(4);
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn with_shard_amount(shard_amount: usize) -> Self {
        Self {
            locks: Arc::new(DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                S::default(),
                shard_amount,
            )),
        }
    }
}

impl<K, S> NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Creates an empty [`NamedRwLock`] that hashes keys with `hasher`.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::with_hasher(RandomState::new());
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty [`NamedRwLock`] with room for `capacity` keys that hashes keys with
    /// `hasher`.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::with_capacity_and_hasher(64, RandomState::new());
    /// assert_eq!(named.len(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            locks: Arc::new(DashMap::with_capacity_and_hasher(capacity, hasher)),
        }
    }

    /// Returns `true` if no key is held or awaited.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    ///
    /// let token = named.acquire_write("a").wait();
    /// assert!(!named.is_empty());
    ///
    /// token.release().unwrap();
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Returns the number of keys held or awaited.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<u8> = NamedRwLock::new();
    /// let a = named.acquire_read(1).wait();
    /// let b = named.acquire_read(1).wait();
    /// let c = named.acquire_write(2).wait();
    /// assert_eq!(named.len(), 2);
    /// ```
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` if the key is held or awaited.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<u8> = NamedRwLock::new();
    /// let token = named.try_write(3).unwrap();
    /// assert!(named.contains(&3));
    /// assert!(!named.contains(&4));
    /// ```
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.locks.contains_key(key)
    }

    /// Runs `acquire` on the lock of `key` while the record map shard is held.
    ///
    /// A missing record is created, and only inserted if `used` holds for the result. Since the
    /// lock stops being idle before the shard is released, a concurrent
    /// [`remove_if_idle`](Self::remove_if_idle) cannot remove the record from under the
    /// acquisition.
    fn attach<R, A, U>(&self, key: K, acquire: A, used: U) -> R
    where
        A: FnOnce(&FairRwLock) -> R,
        U: FnOnce(&R) -> bool,
    {
        match self.locks.entry(key) {
            Entry::Occupied(entry) => acquire(entry.get()),
            Entry::Vacant(entry) => {
                let lock = FairRwLock::new();
                let result = acquire(&lock);
                if used(&result) {
                    trace!("lock record created");
                    entry.insert(lock);
                }
                result
            }
        }
    }

    /// Removes the record of `key` if it still refers to `lock` and `lock` is idle.
    fn remove_if_idle(&self, key: &K, lock: &FairRwLock) {
        if !lock.is_idle(Acquire) {
            return;
        }
        if self
            .locks
            .remove_if(key, |_, current| current.ptr_eq(lock) && current.is_idle(Acquire))
            .is_some()
        {
            trace!("lock record removed");
        }
    }

    /// Returns the hash of `key` under the hasher of the record map.
    fn hash(&self, key: &K) -> u64 {
        self.locks.hasher().hash_one(key)
    }
}

impl<K, S> NamedRwLock<K, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Acquires the read lock of `key`.
    ///
    /// The returned [`Deferred`] is already complete if the write lock of `key` is not held and no
    /// request for `key` is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    ///
    /// let writer = named.acquire_write("a").wait();
    /// let reader = named.acquire_read("a");
    /// assert!(!reader.is_done());
    /// assert!(named.acquire_read("b").is_done());
    ///
    /// writer.release().unwrap();
    /// assert!(reader.is_done());
    /// ```
    pub fn acquire_read(&self, key: K) -> Deferred<NamedReadLockToken<K, S>> {
        let hash = self.hash(&key);
        let registry = self.clone();
        self.attach(key.clone(), FairRwLock::acquire_read, |_| true)
            .map(move |token| {
                NamedReadLockToken(Hold::new(Holding::Shared(token), registry, key, hash))
            })
    }

    /// Acquires the write lock of `key`.
    ///
    /// The returned [`Deferred`] is already complete if the lock of `key` is not held and no
    /// request for `key` is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    ///
    /// let reader = named.acquire_read("a").wait();
    /// let writer = named.acquire_write("a");
    /// assert!(!writer.is_done());
    ///
    /// reader.release().unwrap();
    /// assert!(writer.is_done());
    /// ```
    pub fn acquire_write(&self, key: K) -> Deferred<NamedWriteLockToken<K, S>> {
        let hash = self.hash(&key);
        let registry = self.clone();
        self.attach(key.clone(), FairRwLock::acquire_write, |_| true)
            .map(move |token| {
                NamedWriteLockToken(Hold::new(Holding::Exclusive(token), registry, key, hash))
            })
    }
}

impl<K, S> NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Tries to acquire the read lock of `key`.
    ///
    /// Returns `None` if the write lock of `key` is held or a request for `key` is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    ///
    /// let writer = named.try_write("a").unwrap();
    /// assert!(named.try_read("a").is_none());
    /// assert!(named.try_read("b").is_some());
    /// ```
    #[must_use]
    pub fn try_read(&self, key: K) -> Option<NamedReadLockToken<K, S>> {
        let hash = self.hash(&key);
        let token = self.attach(key.clone(), FairRwLock::try_read, Option::is_some)?;
        Some(NamedReadLockToken(Hold::new(
            Holding::Shared(token),
            self.clone(),
            key,
            hash,
        )))
    }

    /// Tries to acquire the write lock of `key`.
    ///
    /// Returns `None` if the lock of `key` is held or a request for `key` is waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    ///
    /// let reader = named.try_read("a").unwrap();
    /// assert!(named.try_write("a").is_none());
    ///
    /// reader.release().unwrap();
    /// assert!(named.try_write("a").is_some());
    /// ```
    #[must_use]
    pub fn try_write(&self, key: K) -> Option<NamedWriteLockToken<K, S>> {
        let hash = self.hash(&key);
        let token = self.attach(key.clone(), FairRwLock::try_write, Option::is_some)?;
        Some(NamedWriteLockToken(Hold::new(
            Holding::Exclusive(token),
            self.clone(),
            key,
            hash,
        )))
    }
}

impl<K, S> Clone for NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K, S> Default for NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> fmt::Debug for NamedRwLock<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedRwLock")
            .field("len", &self.locks.len())
            .finish()
    }
}

impl<K, S> NamedReadLockToken<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Returns the key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.0.key
    }

    /// Releases the read lock.
    ///
    /// Waiting requests for the key that inherit the lock are completed on the current thread
    /// before this method returns, or, if called from a continuation, once the continuation
    /// returns. The record of the key is removed if it is no longer used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentKeyModification`] if the hash of the key has changed since
    /// acquisition; the read lock then remains held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    /// let token = named.acquire_read("a").wait();
    /// assert_eq!(*token.key(), "a");
    /// assert!(token.release().is_ok());
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    pub fn release(mut self) -> Result<(), Error> {
        self.0.release()
    }
}

impl<K, S> NamedWriteLockToken<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    /// Returns the key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.0.key
    }

    /// Releases the write lock.
    ///
    /// Waiting requests for the key that inherit the lock are completed on the current thread
    /// before this method returns, or, if called from a continuation, once the continuation
    /// returns. The record of the key is removed if it is no longer used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentKeyModification`] if the hash of the key has changed since
    /// acquisition; the write lock then remains held.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::NamedRwLock;
    ///
    /// let named: NamedRwLock<&str> = NamedRwLock::new();
    /// let token = named.acquire_write("a").wait();
    /// assert!(token.release().is_ok());
    /// assert!(named.is_empty());
    /// ```
    #[inline]
    pub fn release(mut self) -> Result<(), Error> {
        self.0.release()
    }
}

impl<K, S> Hold<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    fn new(holding: Holding, registry: NamedRwLock<K, S>, key: K, hash: u64) -> Self {
        Self {
            holding: Some(holding),
            registry,
            key,
            hash,
        }
    }

    fn release(&mut self) -> Result<(), Error> {
        let Some(holding) = self.holding.take() else {
            return Ok(());
        };
        if self.registry.hash(&self.key) != self.hash {
            debug!(
                acquired = self.hash,
                "key hash changed, leaving the lock held"
            );
            drop(holding.disarm());
            return Err(Error::ConcurrentKeyModification);
        }
        let lock = holding.release();
        self.registry.remove_if_idle(&self.key, &lock);
        Ok(())
    }
}

impl<K, S> Drop for Hold<K, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    #[inline]
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(error = %e, "failed to release a dropped named lock token");
        }
    }
}

impl Holding {
    /// Releases the per-key lock and returns it.
    fn release(self) -> FairRwLock {
        match self {
            Holding::Shared(token) => {
                let lock = token.lock().clone();
                token.release();
                lock
            }
            Holding::Exclusive(token) => {
                let lock = token.lock().clone();
                token.release();
                lock
            }
        }
    }

    /// Gives up the token without releasing the per-key lock.
    fn disarm(self) -> FairRwLock {
        match self {
            Holding::Shared(token) => token.disarm(),
            Holding::Exclusive(token) => token.disarm(),
        }
    }
}

impl<K, S> fmt::Debug for NamedReadLockToken<K, S>
where
    K: Eq + Hash + Clone + fmt::Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedReadLockToken")
            .field("key", &self.0.key)
            .field("released", &self.0.holding.is_none())
            .finish()
    }
}

impl<K, S> fmt::Debug for NamedWriteLockToken<K, S>
where
    K: Eq + Hash + Clone + fmt::Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedWriteLockToken")
            .field("key", &self.0.key)
            .field("released", &self.0.holding.is_none())
            .finish()
    }
}
