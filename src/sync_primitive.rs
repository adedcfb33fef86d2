//! Define base operations for synchronization primitives.

use std::sync::PoisonError;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
#[cfg(not(feature = "loom"))]
use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;
#[cfg(feature = "loom")]
use loom::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::opcode::Opcode;
use crate::wait_queue::{Entry, WaitQueue};

/// Define base operations for synchronization primitives.
///
/// The lock state is a `usize` value: the bits in [`WaitQueue::DATA_MASK`] hold the owner state,
/// and [`WaitQueue::QUEUED_FLAG`] is set if and only if the wait queue is not empty. The flag and
/// the wait queue are only modified while the wait queue mutex is held.
pub(crate) trait SyncPrimitive: Sized {
    /// Returns a reference to the state.
    fn state(&self) -> &AtomicUsize;

    /// Returns a reference to the wait queue mutex.
    fn wait_queue_mutex(&self) -> &Mutex<WaitQueue>;

    /// Completes wait queue entries that have inherited ownership.
    fn grant(&self, granted: Vec<Entry>);

    /// Locks the wait queue; no user code runs under the lock, so poisoning is ignored.
    fn wait_queue(&self) -> MutexGuard<'_, WaitQueue> {
        self.wait_queue_mutex()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the resource for the entry or pushes the entry into the wait queue.
    ///
    /// Returns the entry if the resource was acquired; the caller completes it.
    #[must_use]
    fn wait_resources(&self, entry: Entry) -> Option<Entry> {
        let mode = entry.opcode();
        let mut wait_queue = self.wait_queue();
        let result = self.state().fetch_update(AcqRel, Acquire, |state| {
            if mode.can_acquire(state) {
                Some(state + mode.release_count())
            } else {
                Some(state | WaitQueue::QUEUED_FLAG)
            }
        });
        let (Ok(state) | Err(state)) = result;
        if mode.can_acquire(state) {
            return Some(entry);
        }
        wait_queue.push(entry);
        trace!(?mode, waiters = wait_queue.len(), "request enqueued");
        None
    }

    /// Releases resources represented by the supplied operation mode.
    ///
    /// Returns `false` if the resource cannot be released.
    fn release_loop(&self, mode: Opcode) -> bool {
        let mut state = self.state().load(Acquire);
        while mode.can_release(state) {
            let next_state = state - mode.release_count();
            match self
                .state()
                .compare_exchange(state, next_state, AcqRel, Relaxed)
            {
                Ok(_) => {
                    if next_state == WaitQueue::QUEUED_FLAG {
                        // This was the last owner, and there are waiting requests.
                        self.process_wait_queue();
                    }
                    return true;
                }
                Err(new_state) => state = new_state,
            }
        }
        false
    }

    /// Hands the free lock over to the requests at the front of the wait queue.
    ///
    /// The granted requests are completed after the wait queue is unlocked; see
    /// [`complete_grants`](crate::wait_queue::complete_grants).
    fn process_wait_queue(&self) {
        let mut wait_queue = self.wait_queue();
        if self.state().load(Acquire) != WaitQueue::QUEUED_FLAG {
            // Another thread has already processed the wait queue.
            return;
        }

        let (granted, data) = wait_queue.pop_grantable();
        let next_state = if wait_queue.is_empty() {
            data
        } else {
            data | WaitQueue::QUEUED_FLAG
        };

        // There is no owner, and the flag is set, so no other thread can update the state.
        let result =
            self.state()
                .compare_exchange(WaitQueue::QUEUED_FLAG, next_state, AcqRel, Relaxed);
        debug_assert!(result.is_ok());
        let waiters = wait_queue.len();
        drop(wait_queue);

        let mode = granted.first().map(Entry::opcode);
        trace!(?mode, granted = granted.len(), waiters, "wait queue processed");
        self.grant(granted);
    }
}
