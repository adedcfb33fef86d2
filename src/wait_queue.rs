//! Wait queue implementation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;

use crate::deferred::Completer;
use crate::lock::FairRwLock;
use crate::opcode::Opcode;
use crate::token::{ReadLockToken, WriteLockToken};

/// Fair wait queue for [`FairRwLock`].
///
/// Requests are pushed at the back and granted from the front in arrival order. The queue is only
/// accessed under the mutex of the owning lock, and the lock state carries
/// [`QUEUED_FLAG`](Self::QUEUED_FLAG) whenever the queue is not empty.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    /// Pending requests in arrival order.
    entries: VecDeque<Entry>,
}

/// Granted requests waiting to be completed by the grant pass running on this thread.
type GrantList = RefCell<Option<VecDeque<(FairRwLock, Entry)>>>;

#[cfg(not(feature = "loom"))]
std::thread_local! {
    /// `Some` while a grant pass runs on this thread.
    static GRANTS: GrantList = const { RefCell::new(None) };
}

#[cfg(feature = "loom")]
loom::thread_local! {
    static GRANTS: GrantList = RefCell::new(None);
}

/// Marks a running grant pass; dropped when the outermost pass ends or unwinds.
struct GrantPass;

/// Wait queue entry.
pub(crate) enum Entry {
    /// A pending read request.
    Shared(Completer<ReadLockToken>),
    /// A pending write request.
    Exclusive(Completer<WriteLockToken>),
}

impl WaitQueue {
    /// Indicates that the wait queue is not empty.
    pub(crate) const QUEUED_FLAG: usize = 1_usize << (usize::BITS - 1);

    /// Mask to extract the lock owner state from a `usize` value.
    pub(crate) const DATA_MASK: usize = Self::QUEUED_FLAG - 1;

    /// Returns the number of pending requests.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no pending requests.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pushes a request at the back of the queue.
    #[inline]
    pub(crate) fn push(&mut self, entry: Entry) {
        self.entries.push_back(entry);
    }

    /// Pops the requests that inherit ownership of a free lock.
    ///
    /// A write request at the front is popped alone. Otherwise, the contiguous read requests at the
    /// front are popped together, up to [`FairRwLock::MAX_SHARED_OWNERS`]. Returns the popped
    /// entries and the lock owner state they amount to.
    pub(crate) fn pop_grantable(&mut self) -> (Vec<Entry>, usize) {
        let mut granted = Vec::new();
        let mut data = 0;
        while let Some(entry) = self.entries.front() {
            let mode = entry.opcode();
            if mode == Opcode::Exclusive && !granted.is_empty() {
                // The batch of readers must drain before the writer.
                break;
            }
            if mode == Opcode::Shared && data >= FairRwLock::MAX_SHARED_OWNERS {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                data += mode.release_count();
                granted.push(entry);
            }
            if mode == Opcode::Exclusive {
                break;
            }
        }
        (granted, data)
    }
}

impl Entry {
    /// Returns the operation code.
    #[inline]
    pub(crate) const fn opcode(&self) -> Opcode {
        match self {
            Entry::Shared(_) => Opcode::Shared,
            Entry::Exclusive(_) => Opcode::Exclusive,
        }
    }

    /// Completes the request with a token of `lock`.
    ///
    /// The lock state must already account for the request.
    pub(crate) fn grant(self, lock: &FairRwLock) {
        match self {
            Entry::Shared(completer) => completer.complete(ReadLockToken::new(lock.clone())),
            Entry::Exclusive(completer) => completer.complete(WriteLockToken::new(lock.clone())),
        }
    }
}

/// Completes requests of `lock` that have inherited ownership.
///
/// Completing a request may release a lock again, e.g., in a continuation or by dropping the token
/// of an abandoned request, and that release may grant further requests. Grants made while a pass
/// is already running on this thread are appended to its list and completed by the outermost pass
/// in a loop, so the stack does not grow with the length of the wait queue.
pub(crate) fn complete_grants(lock: &FairRwLock, granted: Vec<Entry>) {
    let granted = GRANTS.with(|grants| {
        let mut grants = grants.borrow_mut();
        if let Some(pending) = grants.as_mut() {
            pending.extend(granted.into_iter().map(|entry| (lock.clone(), entry)));
            None
        } else {
            *grants = Some(VecDeque::new());
            Some(granted)
        }
    });
    let Some(granted) = granted else {
        return;
    };

    let _pass = GrantPass;
    for entry in granted {
        entry.grant(lock);
    }
    while let Some((lock, entry)) =
        GRANTS.with(|grants| grants.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        entry.grant(&lock);
    }
}

impl Drop for GrantPass {
    #[inline]
    fn drop(&mut self) {
        let pending = GRANTS.with(|grants| grants.borrow_mut().take());
        drop(pending);
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entry").field(&self.opcode()).finish()
    }
}
