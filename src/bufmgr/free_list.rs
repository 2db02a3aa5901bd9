use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot_core::SpinWait;

use crate::error;
use crate::latch::HybridLatch;

use super::{BfState, BufferFrame};

/// Lock-free stack of unused frames, linked through `header.next_free`.
///
/// `counter` is an eventually consistent hint of the stack length, it is
/// never used for correctness decisions, only for low-water checks and
/// backoff.
pub(crate) struct FreeList {
    head: AtomicPtr<HybridLatch<BufferFrame>>,
    counter: AtomicUsize,
}

impl FreeList {
    pub(crate) fn new() -> FreeList {
        FreeList {
            head: AtomicPtr::new(ptr::null_mut()),
            counter: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn counter(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub(crate) fn push(&self, latch: &'static HybridLatch<BufferFrame>) {
        let frame = unsafe { &*latch.data_ptr() };
        debug_assert_eq!(BfState::Free, frame.state);
        debug_assert!(!latch.is_exclusively_latched());

        let latch_ptr = latch as *const HybridLatch<BufferFrame> as *mut HybridLatch<BufferFrame>;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            frame.next_free.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, latch_ptr, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops a free frame, unwinding when the stack is observed empty.
    ///
    /// Callers are expected to consult [`FreeList::counter`] (and
    /// [`FreeList::spin_until_at_least`]) before retrying so that they do not
    /// hammer an exhausted pool.
    pub(crate) fn pop(&self) -> error::Result<&'static HybridLatch<BufferFrame>> {
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            let latch = unsafe { &*head };
            let next = unsafe { (*latch.data_ptr()).next_free.load(Ordering::Acquire) };
            match self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => {
                    self.counter.fetch_sub(1, Ordering::Relaxed);
                    let frame = unsafe { &*latch.data_ptr() };
                    frame.next_free.store(ptr::null_mut(), Ordering::Relaxed);
                    debug_assert_eq!(BfState::Free, frame.state);
                    debug_assert!(!latch.is_exclusively_latched());
                    return Ok(latch);
                }
                Err(current) => head = current,
            }
        }
        Err(error::Error::Unwind)
    }

    /// Spins until the length hint reaches `n`. Used as backoff after an
    /// allocation or fault-in failed on an exhausted pool.
    pub(crate) fn spin_until_at_least(&self, n: usize) {
        let mut spinwait = SpinWait::new();
        while self.counter() < n {
            if !spinwait.spin() {
                spinwait.reset();
            }
        }
    }
}
