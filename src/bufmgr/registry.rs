use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error;
use crate::latch::{HybridGuard, HybridLatch};

use super::swip::Swip;
use super::{BufferFrame, OptSwipGuard};

pub type DataStructureId = u64;

/// Result of locating the swip currently pointing at a frame.
pub enum ParentResult {
    /// The frame is a registered root, there is no parent swip to unswizzle.
    Root,
    /// Optimistic guard over the parent frame, narrowed to the swip slot.
    Parent(OptSwipGuard<'static>),
}

/// Callbacks a managed data structure provides so the buffer manager can walk
/// parent to child swip relationships inside its pages.
///
/// Both operations run under the caller's guards and must be unwind-only:
/// never block on a latch, report any observed inconsistency as
/// [`error::Error::Unwind`]. The buffer manager may call them while holding
/// the needle frame exclusively.
pub trait ManagedDataStructure: Send + Sync {
    /// Calls `f` for every child swip stored in the needle page, stopping
    /// early when `f` returns `Ok(false)`.
    fn iterate_children_swips<'a>(
        &self,
        needle: &dyn HybridGuard<BufferFrame, BufferFrame>,
        f: Box<dyn FnMut(&Swip<HybridLatch<BufferFrame>>) -> error::Result<bool> + 'a>,
    ) -> error::Result<()>;

    /// Locates the unique swip pointing at the needle frame at this instant.
    fn find_parent(
        &self,
        needle: &dyn HybridGuard<BufferFrame, BufferFrame>,
    ) -> error::Result<ParentResult>;
}

/// Table of the data structure instances sharing the buffer pool, keyed by
/// their id. Implementing [`ManagedDataStructure`] supplies the callback
/// vtable of an instance; registering it hands the instance to the manager.
pub struct Registry {
    dtid_counter: AtomicU64,
    dt_map: scc::HashMap<DataStructureId, Arc<dyn ManagedDataStructure>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            dtid_counter: AtomicU64::new(0),
            dt_map: scc::HashMap::default(),
        }
    }

    pub fn reserve_dtid(&self) -> DataStructureId {
        self.dtid_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn register(&self, dtid: DataStructureId, dt: Arc<dyn ManagedDataStructure>) {
        if self.dt_map.insert(dtid, dt).is_err() {
            panic!("data structure id {} registered twice", dtid);
        }
    }

    pub fn deregister(&self, dtid: DataStructureId) {
        let _ = self.dt_map.remove(&dtid);
    }

    pub fn get(&self, dtid: DataStructureId) -> Option<Arc<dyn ManagedDataStructure>> {
        self.dt_map.read(&dtid, |_, dt| Arc::clone(dt))
    }
}
