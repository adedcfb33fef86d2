//! [`Deferred`] is a single-shot value that is completed by another party.

use std::fmt;
use std::future::Future;
use std::iter::repeat_with;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
#[cfg(not(feature = "loom"))]
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
#[cfg(not(feature = "loom"))]
use std::thread::{Thread, current, park};

#[cfg(feature = "loom")]
use loom::sync::{Mutex, MutexGuard};
#[cfg(feature = "loom")]
use loom::thread::{Thread, current, park};

/// [`Deferred`] is a single-shot value that is completed by another party.
///
/// Lock acquisitions return a [`Deferred`] token: it is already complete if the lock was granted
/// immediately, otherwise it is completed by the release that grants the lock. The value can be
/// awaited, waited for synchronously, or passed to a continuation.
///
/// Dropping a [`Deferred`] before it completes is allowed: the value is then dropped on the thread
/// that completes it, which, for lock tokens, releases the lock.
#[must_use = "dropping a `Deferred` lock token releases the lock as soon as it is granted"]
pub struct Deferred<T> {
    /// Shared completion slot, `None` once the value has been taken.
    slot: Option<Arc<Slot<T>>>,
}

/// The completing side of a [`Deferred`].
pub(crate) struct Completer<T> {
    slot: Arc<Slot<T>>,
}

/// Completion slot shared by a [`Deferred`] and its [`Completer`].
struct Slot<T> {
    state: Mutex<State<T>>,
}

/// Continuation invoked with the completed value.
type Continuation<T> = Box<dyn FnOnce(T) + Send>;

/// Completion state.
enum State<T> {
    /// Not yet completed; the monitor is notified on completion.
    Pending(Option<Monitor>),
    /// Not yet completed; the continuation receives the value.
    Continued(Continuation<T>),
    /// Completed, the value has not been taken yet.
    Ready(T),
    /// The [`Deferred`] was dropped before completion.
    Abandoned,
    /// The value has been taken.
    Taken,
}

/// Notifies the party waiting for the result.
enum Monitor {
    /// Wakes an asynchronous task.
    Async(Waker),
    /// Unparks a thread.
    Sync(Thread),
}

impl<T> Deferred<T> {
    /// Creates an already completed [`Deferred`].
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::Deferred;
    ///
    /// let deferred = Deferred::ready(7);
    /// assert!(deferred.is_done());
    /// assert_eq!(deferred.wait(), 7);
    /// ```
    #[inline]
    pub fn ready(value: T) -> Self {
        Self {
            slot: Some(Arc::new(Slot::new(State::Ready(value)))),
        }
    }

    /// Creates a pending [`Deferred`] and the [`Completer`] that completes it.
    pub(crate) fn pending() -> (Self, Completer<T>) {
        let slot = Arc::new(Slot::new(State::Pending(None)));
        (
            Self {
                slot: Some(slot.clone()),
            },
            Completer { slot },
        )
    }

    /// Returns `true` if the value is available.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    ///
    /// let writer = lock.acquire_write();
    /// assert!(writer.is_done());
    ///
    /// let reader = lock.acquire_read();
    /// assert!(!reader.is_done());
    ///
    /// writer.wait().release();
    /// assert!(reader.is_done());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| matches!(*slot.lock(), State::Ready(_)))
    }

    /// Takes the value if it is available.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::Deferred;
    ///
    /// let mut deferred = Deferred::ready("value");
    /// assert_eq!(deferred.try_take(), Some("value"));
    /// assert_eq!(deferred.try_take(), None);
    /// ```
    pub fn try_take(&mut self) -> Option<T> {
        let slot = self.slot.as_ref()?;
        let mut state = slot.lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(value) => {
                drop(state);
                self.slot = None;
                Some(value)
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// Registers a continuation that receives the value.
    ///
    /// The continuation is invoked on the calling thread if the value is already available,
    /// otherwise on the thread that completes the [`Deferred`], after all internal locks have been
    /// released. It is invoked at most once.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    ///
    /// let lock = FairRwLock::new();
    /// let writer = lock.acquire_write().wait();
    ///
    /// let reentrant = lock.clone();
    /// lock.acquire_read().on_complete(move |token| {
    ///     assert!(reentrant.is_shared(std::sync::atomic::Ordering::Relaxed));
    ///     token.release();
    /// });
    ///
    /// writer.release();
    /// assert!(lock.is_idle(std::sync::atomic::Ordering::Relaxed));
    /// ```
    pub fn on_complete<F: FnOnce(T) + Send + 'static>(mut self, f: F) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut state = slot.lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(value) => {
                drop(state);
                f(value);
            }
            State::Pending(_) => *state = State::Continued(Box::new(f)),
            other => *state = other,
        }
    }

    /// Transforms the value once it is available.
    ///
    /// The transformation runs as a continuation, see [`on_complete`](Self::on_complete).
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::Deferred;
    ///
    /// let deferred = Deferred::ready(20).map(|v| v + 1);
    /// assert_eq!(deferred.wait(), 21);
    /// ```
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        T: 'static,
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (mapped, completer) = Deferred::pending();
        self.on_complete(move |value| completer.complete(f(value)));
        mapped
    }

    /// Blocks the current thread until the value is available.
    ///
    /// # Panics
    ///
    /// Panics if the value was already taken by polling the [`Deferred`] to completion.
    ///
    /// # Examples
    ///
    /// ```
    /// use fairlock::FairRwLock;
    /// use std::thread;
    ///
    /// let lock = FairRwLock::new();
    /// let writer = lock.acquire_write().wait();
    ///
    /// let reader = lock.acquire_read();
    /// let thread = thread::spawn(move || reader.wait().release());
    ///
    /// writer.release();
    /// thread.join().unwrap();
    /// ```
    pub fn wait(mut self) -> T {
        let Some(slot) = self.slot.take() else {
            panic!("`Deferred` waited on after its value was taken");
        };
        loop {
            let mut state = slot.lock();
            match mem::replace(&mut *state, State::Taken) {
                State::Ready(value) => return value,
                State::Pending(_) => *state = State::Pending(Some(Monitor::Sync(current()))),
                other => *state = other,
            }
            drop(state);
            park();
        }
    }
}

impl<T> Completer<T> {
    /// Completes the [`Deferred`].
    ///
    /// Notifies the waiting party, or invokes the continuation, after the slot is unlocked. The
    /// value is dropped if the [`Deferred`] was dropped.
    pub(crate) fn complete(self, value: T) {
        let mut state = self.slot.lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Pending(monitor) => {
                *state = State::Ready(value);
                drop(state);
                match monitor {
                    Some(Monitor::Async(waker)) => waker.wake(),
                    Some(Monitor::Sync(thread)) => thread.unpark(),
                    None => (),
                }
            }
            State::Continued(f) => {
                drop(state);
                f(value);
            }
            other => {
                // Abandoned: the value is dropped outside the slot lock since it may be a token.
                *state = other;
                drop(state);
                drop(value);
            }
        }
    }
}

impl<T> Slot<T> {
    fn new(state: State<T>) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Locks the state; no user code runs under the lock, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("done", &self.is_done())
            .field("taken", &self.slot.is_none())
            .finish()
    }
}

impl<T> Drop for Deferred<T> {
    #[inline]
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut state = slot.lock();
        let previous = mem::replace(&mut *state, State::Abandoned);
        drop(state);

        // A completed value that was never observed, e.g., a granted lock token, is dropped here.
        drop(previous);
    }
}

impl<T> Future for Deferred<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(slot) = this.slot.as_ref() else {
            panic!("`Deferred` polled after completion");
        };
        let mut state = slot.lock();
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(value) => {
                drop(state);
                this.slot = None;
                Poll::Ready(value)
            }
            State::Pending(_) => {
                *state = State::Pending(Some(Monitor::Async(cx.waker().clone())));
                Poll::Pending
            }
            other => {
                *state = other;
                Poll::Pending
            }
        }
    }
}

/// Accumulates the results of [`join_all`].
struct Collector<T> {
    results: Vec<Option<T>>,
    remaining: usize,
    completer: Option<Completer<Vec<T>>>,
}

/// Combines [`Deferred`] values into one that completes when all of them have completed.
///
/// The results are yielded in the order of the input.
///
/// # Examples
///
/// ```
/// use fairlock::{FairRwLock, join_all};
///
/// let lock = FairRwLock::new();
/// let writer = lock.acquire_write().wait();
///
/// let readers = join_all((0..3).map(|_| lock.acquire_read()));
/// assert!(!readers.is_done());
///
/// writer.release();
/// assert!(readers.is_done());
/// readers.wait().into_iter().for_each(|token| token.release());
/// ```
pub fn join_all<T, I>(deferreds: I) -> Deferred<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Deferred<T>>,
{
    let deferreds: Vec<Deferred<T>> = deferreds.into_iter().collect();
    if deferreds.is_empty() {
        return Deferred::ready(Vec::new());
    }

    let (joined, completer) = Deferred::pending();
    let collector = Arc::new(Mutex::new(Collector {
        results: repeat_with(|| None).take(deferreds.len()).collect(),
        remaining: deferreds.len(),
        completer: Some(completer),
    }));
    for (index, deferred) in deferreds.into_iter().enumerate() {
        let collector = collector.clone();
        deferred.on_complete(move |value| {
            let mut collector = collector.lock().unwrap_or_else(PoisonError::into_inner);
            collector.results[index] = Some(value);
            collector.remaining -= 1;
            if collector.remaining != 0 {
                return;
            }
            let results = collector.results.drain(..).flatten().collect();
            let completer = collector.completer.take();
            drop(collector);
            if let Some(completer) = completer {
                completer.complete(results);
            }
        });
    }
    joined
}
