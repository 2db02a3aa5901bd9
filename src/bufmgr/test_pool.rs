use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags};

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};

use crate::latch::HybridLatch;

use super::swip::Pid;
use super::{BfState, BufferFrame, Page};

/// Builds a standalone pool of initialized frames for unit tests that do not
/// need a full buffer manager. Pids are assigned sequentially and every page
/// starts dirty (`lsn = 1`).
pub(crate) fn leak_test_frames(
    n_pages: usize,
    page_size: usize,
) -> &'static [HybridLatch<BufferFrame>] {
    let pool_size = n_pages * page_size;

    let addr = unsafe {
        nix::sys::mman::mmap(
            std::ptr::null_mut(),
            pool_size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
        .expect("failed to init test frames")
    };
    unsafe {
        nix::sys::mman::madvise(addr, pool_size, MmapAdvise::MADV_DONTFORK)
            .expect("failed to configure pool")
    };

    let mut frames = vec![];
    for frame_idx in 0..n_pages {
        let page_ptr = unsafe { (addr as *mut u8).add(frame_idx * page_size) } as *mut Page;
        let page_ref: &'static mut Page = unsafe { &mut *page_ptr };
        page_ref.capacity = (page_size - Page::HEADER_SIZE) as u64;
        page_ref.magic_debugging_number = frame_idx as u64;
        page_ref.lsn = 1;

        frames.push(HybridLatch::new(BufferFrame {
            state: BfState::Free,
            pid: Pid::new(frame_idx as u64),
            last_written_lsn: AtomicU64::new(0),
            writeback: AtomicBool::new(false),
            cooled_by_read: AtomicBool::new(false),
            next_free: AtomicPtr::new(ptr::null_mut()),
            page: page_ref,
        }));
    }

    frames.leak()
}
