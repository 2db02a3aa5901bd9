//! In-memory page cache for an embedded storage engine.
//!
//! The buffer manager mediates between fixed-size pages on a block device
//! and in-memory frames accessed by index data structures. Parent pages
//! reference children through [`bufmgr::swip::Swip`]s, one-word references
//! that are either a page id or, once the child is resident, a raw frame
//! pointer. Workers resolve swips optimistically and restart on any version
//! change or page fault, so the hot path never blocks on I/O.
//!
//! A background page provider keeps the pool healthy in three phases:
//! unswizzling hot frames into a cooling stage, evicting clean cooled frames
//! and staging dirty ones for asynchronous writeback, then reaping completed
//! writes.
//!
//! ```no_run
//! use swipbuf::{BufferManager, BufMgrOptions};
//!
//! let options = BufMgrOptions {
//!     dram_gib: 0.1,
//!     ssd_path: "/tmp/pool.db".into(),
//!     truncate: true,
//!     ..BufMgrOptions::default()
//! };
//! let manager = BufferManager::new_leaked(options).unwrap();
//! manager.start_background_threads();
//!
//! let frame = loop {
//!     match manager.allocate_page_for(0) {
//!         Ok(frame) => break frame,
//!         Err(_) => continue,
//!     }
//! };
//! manager.reclaim_page(frame);
//! manager.persist();
//! ```

use once_cell::sync::OnceCell;

pub mod bufmgr;
pub mod error;
pub mod latch;

pub use bufmgr::{BufMgrOptions, BufferFrame, BufferManager, Page};
pub use error::BufMgrError;

static BUFMGR: OnceCell<BufferManager> = OnceCell::new();

/// The process-wide buffer manager. Only valid after
/// [`setup_global_bufmgr`] or [`ensure_global_bufmgr`] returned.
#[inline]
pub fn bufmgr() -> &'static BufferManager {
    unsafe { BUFMGR.get_unchecked() }
}

/// Installs the process-wide buffer manager and starts its background
/// threads. Panics when called twice.
pub fn setup_global_bufmgr(options: BufMgrOptions) -> Result<(), BufMgrError> {
    let manager = BufferManager::new(options)?;
    if BUFMGR.set(manager).is_err() {
        panic!("global buffer manager already initialized");
    }
    let manager = bufmgr();
    manager.init();
    manager.start_background_threads();
    Ok(())
}

/// Installs the process-wide buffer manager unless one already exists.
pub fn ensure_global_bufmgr(
    options: BufMgrOptions,
) -> Result<&'static BufferManager, BufMgrError> {
    let mut needs_init = false;
    let manager = BUFMGR.get_or_try_init(|| {
        needs_init = true;
        BufferManager::new(options)
    })?;

    if needs_init {
        manager.init();
        manager.start_background_threads();
    }

    Ok(manager)
}
