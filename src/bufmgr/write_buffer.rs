use crossbeam_queue::ArrayQueue;
use io_uring::IoUring;
use std::collections::HashSet;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;

use crate::latch::HybridLatch;

use super::swip::Pid;
use super::BufferFrame;

#[derive(PartialEq, Eq, Debug)]
enum State {
    Free,
    Ready,
    Pending,
    Done,
}

#[derive(Clone, Copy)]
struct PageMeta {
    pid: Pid,
    /// Page LSN captured when the payload was copied into the slot. Reported
    /// back through [`AsyncWriteBuffer::collect`] as the persisted LSN.
    lsn: u64,
    frame: &'static HybridLatch<BufferFrame>,
}

struct Slot {
    state: State,
    alignment_offset: usize,
    storage: Box<[u8]>,
    size: usize,
    meta: Option<PageMeta>,
}

impl Slot {
    fn slot_bytes(&self) -> &[u8] {
        &self.storage[self.alignment_offset..(self.alignment_offset + self.size)]
    }

    fn slot_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.alignment_offset..(self.alignment_offset + self.size)]
    }

    fn to_ready(&mut self, meta: PageMeta) {
        match self.state {
            State::Free => {
                self.meta = Some(meta);
                self.state = State::Ready;
            }
            _ => panic!("only free slots can become ready"),
        }
    }

    fn to_pending(&mut self) {
        match self.state {
            State::Ready => self.state = State::Pending,
            _ => panic!("only ready slots can become pending"),
        }
    }

    fn to_done(&mut self) {
        match self.state {
            State::Pending => self.state = State::Done,
            _ => panic!("only pending slots can become done"),
        }
    }

    fn to_free(&mut self) {
        match self.state {
            State::Done => {
                self.meta.take();
                self.state = State::Free;
            }
            _ => panic!("only done slots can become free"),
        }
    }
}

/// Allocates `size` bytes with the requested alignment, returning the offset
/// of the aligned window inside the allocation.
pub(crate) fn aligned_boxed_slice(size: usize, alignment: usize) -> (usize, Box<[u8]>) {
    let storage_size = size + alignment;
    let storage = vec![0u8; storage_size].into_boxed_slice();
    let alignment_offset = alignment - (storage.as_ptr() as usize % alignment);
    (alignment_offset, storage)
}

/// Bounded batch of in-flight asynchronous page writes.
///
/// Every accepted frame gets its payload copied into a 512 byte aligned
/// staging slot, so the write survives the frame being swizzled back and
/// modified while the I/O is in flight.
pub(crate) struct AsyncWriteBuffer {
    slot_size: usize,
    n_slots: usize,
    free_slots: ArrayQueue<usize>,
    slots: Vec<Slot>,
    staged: HashSet<Pid>,
    ring: IoUring,
    fd: RawFd,
}

impl AsyncWriteBuffer {
    pub(crate) fn new(fd: &impl AsRawFd, slot_size: usize, n_slots: usize) -> AsyncWriteBuffer {
        let free_slots = ArrayQueue::new(n_slots);
        let mut slots = vec![];

        for i in 0..n_slots {
            free_slots.push(i).unwrap();
            let (alignment_offset, storage) = aligned_boxed_slice(slot_size, 512);
            slots.push(Slot {
                state: State::Free,
                alignment_offset,
                storage,
                size: slot_size,
                meta: None,
            });
        }

        AsyncWriteBuffer {
            slot_size,
            n_slots,
            free_slots,
            slots,
            staged: HashSet::with_capacity(n_slots),
            ring: IoUring::new(n_slots as u32).expect("failed to create io ring"),
            fd: fd.as_raw_fd(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free_slots.is_empty()
    }

    /// Number of slots with a write somewhere between staged and collected.
    pub(crate) fn pending(&self) -> usize {
        self.n_slots - self.free_slots.len()
    }

    /// Stages a frame for writeback. Refuses (returning `false`) when the
    /// batch is full or the frame's pid is already staged. On acceptance the
    /// frame is marked `writeback`; the flag is cleared by the caller once
    /// the completed write has been collected.
    ///
    /// The caller must guarantee the page bytes are stable for the duration
    /// of the copy (cold frame under the partition mutex).
    pub(crate) fn add(&mut self, latch: &'static HybridLatch<BufferFrame>) -> bool {
        if self.is_full() {
            return false;
        }

        let frame = unsafe { &*latch.data_ptr() };
        let pid = frame.pid;
        if self.staged.contains(&pid) {
            return false;
        }

        let slot_idx = self.free_slots.pop().unwrap();
        let slot = &mut self.slots[slot_idx];

        let page = &*frame.page;
        let src =
            unsafe { std::slice::from_raw_parts(page as *const _ as *const u8, self.slot_size) };
        slot.slot_bytes_mut().copy_from_slice(src);
        slot.to_ready(PageMeta {
            pid,
            lsn: page.lsn,
            frame: latch,
        });

        frame.writeback.store(true, Ordering::Release);
        self.staged.insert(pid);

        let entry = io_uring::opcode::Write::new(
            io_uring::types::Fd(self.fd),
            slot.slot_bytes().as_ptr(),
            slot.slot_bytes().len().try_into().expect("too large"),
        )
        .offset(
            pid.byte_offset(self.slot_size)
                .try_into()
                .expect("offset too large"),
        )
        .build()
        .user_data(slot_idx as u64);

        unsafe { self.ring.submission().push(&entry).expect("must not be full") };

        true
    }

    /// Hands all staged writes to the kernel.
    pub(crate) fn submit(&mut self) {
        let ready_slots: Vec<_> = self
            .slots
            .iter_mut()
            .filter(|s| s.state == State::Ready)
            .collect();
        if !ready_slots.is_empty() {
            self.ring.submit().expect("failed to submit");
            for slot in ready_slots {
                slot.to_pending();
            }
        }
    }

    /// Reaps completion events, returning how many writes finished.
    pub(crate) fn poll_events_sync(&mut self) -> usize {
        let mut count = 0;
        for entry in self.ring.completion() {
            let result = entry.result();
            let slot_idx = entry.user_data() as usize;

            let slot = &mut self.slots[slot_idx];
            // A short or failed direct write is unrecoverable.
            assert_eq!(slot.slot_bytes().len(), result as usize, "page write failed");
            assert_eq!(State::Pending, slot.state);

            slot.to_done();
            count += 1;
        }

        self.ring.completion().sync();

        count
    }

    /// Invokes `f(frame, written_lsn)` for up to `n` completed writes and
    /// recycles their slots.
    pub(crate) fn collect<F>(&mut self, n: usize, mut f: F)
    where
        F: FnMut(&'static HybridLatch<BufferFrame>, u64),
    {
        let mut remaining = n;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if remaining == 0 {
                break;
            }
            if slot.state != State::Done {
                continue;
            }
            let meta = slot.meta.expect("done slot has meta");
            slot.to_free();
            self.staged.remove(&meta.pid);
            self.free_slots.push(i).unwrap();
            remaining -= 1;
            f(meta.frame, meta.lsn);
        }
    }
}
