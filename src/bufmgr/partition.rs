use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use hashlink::LinkedHashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::latch::HybridLatch;

use super::swip::Pid;
use super::BufferFrame;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum CioState {
    /// Some thread is loading the page from disk, the gate mutex is held by
    /// the loader for the duration of the read.
    Reading,
    /// The page is resident and sits in the cooling queue.
    Cooling,
}

/// The part of a CIO record that is shared with threads outside the
/// partition critical section: the gate readers block on while a load is in
/// flight, and the fault coalescing counter.
pub(crate) struct CioShared {
    pub(crate) gate: Mutex<()>,
    pub(crate) readers: AtomicU64,
}

/// Per-pid control record coordinating fault-in and cooling.
pub(crate) struct CioFrame {
    pub(crate) state: CioState,
    pub(crate) shared: Arc<CioShared>,
}

/// Map and queue are kept consistent under the partition mutex: every
/// `Cooling` map entry has its frame in the queue until it is either evicted
/// or swizzled back, and every queued frame has a `Cooling` map entry.
pub(crate) struct PartitionState {
    pub(crate) map: HashMap<Pid, CioFrame>,
    pub(crate) cooling: LinkedHashMap<Pid, &'static HybridLatch<BufferFrame>>,
}

impl PartitionState {
    #[inline]
    pub(crate) fn has(&self, pid: Pid) -> bool {
        self.map.contains_key(&pid)
    }

    /// Registers an in-flight load. Returns the shared handle, with the
    /// reader count already accounting for the loader.
    pub(crate) fn insert_reading(&mut self, pid: Pid) -> Arc<CioShared> {
        let shared = Arc::new(CioShared {
            gate: Mutex::new(()),
            readers: AtomicU64::new(1),
        });
        let previous = self.map.insert(
            pid,
            CioFrame {
                state: CioState::Reading,
                shared: Arc::clone(&shared),
            },
        );
        debug_assert!(previous.is_none());
        shared
    }

    /// Transitions a `Reading` entry to `Cooling` and enqueues its frame.
    pub(crate) fn promote_to_cooling(&mut self, pid: Pid, latch: &'static HybridLatch<BufferFrame>) {
        let cio = self.map.get_mut(&pid).expect("reading entry must exist");
        debug_assert_eq!(CioState::Reading, cio.state);
        cio.state = CioState::Cooling;
        let previous = self.cooling.insert(pid, latch);
        debug_assert!(previous.is_none());
    }

    /// Registers an eviction-driven cooling entry (no load in flight).
    pub(crate) fn insert_cooling(&mut self, pid: Pid, latch: &'static HybridLatch<BufferFrame>) {
        let previous = self.map.insert(
            pid,
            CioFrame {
                state: CioState::Cooling,
                shared: Arc::new(CioShared {
                    gate: Mutex::new(()),
                    readers: AtomicU64::new(0),
                }),
            },
        );
        debug_assert!(previous.is_none());
        let previous = self.cooling.insert(pid, latch);
        debug_assert!(previous.is_none());
    }

    /// Removes the frame from the cooling queue, leaving the map entry in
    /// place. Used when a cooled page is swizzled back while late readers may
    /// still hold a reference on the record.
    pub(crate) fn unqueue(&mut self, pid: Pid) -> Option<&'static HybridLatch<BufferFrame>> {
        self.cooling.remove(&pid)
    }

    /// Drops a pid from both the queue and the map.
    pub(crate) fn remove(&mut self, pid: Pid) {
        self.cooling.remove(&pid);
        let removed = self.map.remove(&pid);
        debug_assert!(removed.is_some());
    }
}

/// One shard of the CIO map and cooling queue. A pid is always routed to the
/// same partition, so per-pid transitions are serialized by this mutex.
pub(crate) struct Partition {
    state: Mutex<PartitionState>,
}

impl Partition {
    pub(crate) fn new(capacity: usize) -> Partition {
        Partition {
            state: Mutex::new(PartitionState {
                map: HashMap::with_capacity(capacity),
                cooling: LinkedHashMap::with_capacity(capacity),
            }),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock()
    }
}
