//! Lock operation types.

use crate::lock::FairRwLock;
use crate::wait_queue::WaitQueue;

/// Operation types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Opcode {
    /// Acquires exclusive ownership.
    Exclusive,
    /// Acquires shared ownership.
    Shared,
}

impl Opcode {
    /// Checks if the resource expressed in `self` can be acquired in `state` without overtaking a
    /// waiting request.
    #[inline]
    pub(crate) const fn can_acquire(self, state: usize) -> bool {
        if state & WaitQueue::QUEUED_FLAG == WaitQueue::QUEUED_FLAG {
            return false;
        }
        let data = state & WaitQueue::DATA_MASK;
        match self {
            Opcode::Exclusive => data == 0,
            Opcode::Shared => data < FairRwLock::MAX_SHARED_OWNERS,
        }
    }

    /// Checks if the resource expressed in `self` can be released from `state`.
    #[inline]
    pub(crate) const fn can_release(self, state: usize) -> bool {
        let data = state & WaitQueue::DATA_MASK;
        match self {
            Opcode::Exclusive => data == WaitQueue::DATA_MASK,
            Opcode::Shared => data >= 1 && data != WaitQueue::DATA_MASK,
        }
    }

    /// Converts the operation mode into a `usize` value representing resources held by the
    /// corresponding lock.
    #[inline]
    pub(crate) const fn release_count(self) -> usize {
        match self {
            Opcode::Exclusive => WaitQueue::DATA_MASK,
            Opcode::Shared => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Opcode;
    use crate::wait_queue::WaitQueue;

    #[test]
    fn acquire_release() {
        assert!(Opcode::Exclusive.can_acquire(0));
        assert!(Opcode::Shared.can_acquire(0));
        assert!(Opcode::Shared.can_acquire(3));
        assert!(!Opcode::Exclusive.can_acquire(3));
        assert!(!Opcode::Shared.can_acquire(WaitQueue::DATA_MASK));
        assert!(!Opcode::Shared.can_acquire(WaitQueue::QUEUED_FLAG | 3));
        assert!(!Opcode::Exclusive.can_acquire(WaitQueue::QUEUED_FLAG));

        assert!(Opcode::Exclusive.can_release(WaitQueue::DATA_MASK | WaitQueue::QUEUED_FLAG));
        assert!(!Opcode::Exclusive.can_release(1));
        assert!(Opcode::Shared.can_release(WaitQueue::QUEUED_FLAG | 1));
        assert!(!Opcode::Shared.can_release(0));
        assert!(!Opcode::Shared.can_release(WaitQueue::DATA_MASK));
    }
}
