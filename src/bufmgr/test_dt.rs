//! Miniature managed data structure for tests: one root page holding child
//! swips, children are leaves stamped with their index.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error;
use crate::latch::{HybridGuard, HybridLatch, OptimisticGuard};

use super::registry::{DataStructureId, ManagedDataStructure, ParentResult};
use super::swip::{Pid, RefOrPid, Swip};
use super::{BfLatchExt, BfOptimisticGuardExt, BfState, BufferFrame, BufferManager};

type FrameSwip = Swip<HybridLatch<BufferFrame>>;

// Root payload layout: u64 child count followed by the swip array.
const LEN_BYTES: usize = 8;

pub(crate) fn child_count(bf: &BufferFrame) -> usize {
    let data = bf.page.data();
    let len = u64::from_ne_bytes(data[..LEN_BYTES].try_into().unwrap()) as usize;
    let max = (bf.page.capacity() - LEN_BYTES) / std::mem::size_of::<FrameSwip>();
    // An optimistic reader may see a torn count, never walk past the page.
    len.min(max)
}

pub(crate) fn swips(bf: &BufferFrame) -> &[FrameSwip] {
    let data = bf.page.data();
    let len = child_count(bf);
    unsafe { std::slice::from_raw_parts(data.as_ptr().add(LEN_BYTES) as *const FrameSwip, len) }
}

fn swips_mut(bf: &mut BufferFrame, len: usize) -> &mut [FrameSwip] {
    let data = bf.page.data_mut();
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr().add(LEN_BYTES) as *mut FrameSwip, len)
    }
}

fn swip_ref(bf: &BufferFrame, pos: usize) -> error::Result<&FrameSwip> {
    swips(bf).get(pos).ok_or(error::Error::Unwind)
}

pub(crate) struct TestTree {
    pub(crate) dtid: DataStructureId,
    pub(crate) root: &'static HybridLatch<BufferFrame>,
    pub(crate) child_pids: Mutex<Vec<Pid>>,
    mgr: &'static BufferManager,
}

impl TestTree {
    /// Allocates a root, registers the tree, then grows it child by child so
    /// the page provider can relieve pool pressure mid-creation.
    pub(crate) fn create(mgr: &'static BufferManager, n_children: usize) -> Arc<TestTree> {
        let dtid = mgr.registry().reserve_dtid();

        let mut root_guard = loop {
            match mgr.allocate_page_for(dtid) {
                Ok(guard) => break guard,
                Err(_) => std::thread::yield_now(),
            }
        };
        root_guard.page.data_mut()[..LEN_BYTES].copy_from_slice(&0u64.to_ne_bytes());
        let root = root_guard.latch();
        drop(root_guard);

        let tree = Arc::new(TestTree {
            dtid,
            root,
            child_pids: Mutex::new(Vec::with_capacity(n_children)),
            mgr,
        });
        mgr.registry()
            .register(dtid, Arc::clone(&tree) as Arc<dyn ManagedDataStructure>);

        for pos in 0..n_children {
            let child = loop {
                match mgr.allocate_page_for(dtid) {
                    Ok(guard) => break guard,
                    Err(_) => std::thread::yield_now(),
                }
            };
            tree.child_pids.lock().push(child.pid);
            let child_latch = child.latch();
            drop(child);

            // Stamp through the dirtying latch helper so the page carries an
            // LSN ahead of its (zero) persisted one.
            {
                let mut child_x = child_latch.exclusive_bf();
                child_x.page.data_mut()[0] = pos as u8;
            }

            let mut root_x = root.exclusive();
            swips_mut(root_x.as_mut(), pos + 1)[pos] = Swip::from_ref(child_latch);
            root_x.page.data_mut()[..LEN_BYTES]
                .copy_from_slice(&((pos + 1) as u64).to_ne_bytes());
        }

        tree
    }

    pub(crate) fn child_pid(&self, pos: usize) -> Pid {
        self.child_pids.lock()[pos]
    }

    /// Resolves child `pos` to its frame latch, restarting until it succeeds.
    pub(crate) fn resolve_child(&self, pos: usize) -> &'static HybridLatch<BufferFrame> {
        loop {
            let attempt = || -> error::Result<&'static HybridLatch<BufferFrame>> {
                let root_guard = self.root.optimistic_or_unwind()?;
                let swip_guard = OptimisticGuard::map(root_guard, |bf| swip_ref(bf, pos))?;
                let (swip_guard, latch) = self.mgr.resolve_swip_fast(swip_guard)?;
                swip_guard.recheck()?;
                Ok(latch)
            };
            match attempt() {
                Ok(latch) => return latch,
                Err(_) => continue,
            }
        }
    }

    /// Returns `(stamp, value)`: the identity byte written at creation and
    /// the last byte stored through [`TestTree::write_child`].
    pub(crate) fn read_child(&self, pos: usize) -> (u8, u8) {
        let expected_pid = self.child_pid(pos);
        loop {
            let latch = self.resolve_child(pos);
            let attempt = || -> error::Result<(u8, u8)> {
                let guard = latch.optimistic_or_unwind()?;
                if guard.state != BfState::Hot || guard.pid != expected_pid {
                    guard.recheck()?;
                    return Err(error::Error::Unwind);
                }
                let stamp = guard.page.data()[0];
                let value = guard.page.data()[1];
                guard.recheck()?;
                Ok((stamp, value))
            };
            if let Ok(bytes) = attempt() {
                return bytes;
            }
        }
    }

    /// Stores `value` in child `pos`'s payload, dirtying the page.
    pub(crate) fn write_child(&self, pos: usize, value: u8) {
        let expected_pid = self.child_pid(pos);
        loop {
            let latch = self.resolve_child(pos);
            let attempt = || -> error::Result<()> {
                let guard = latch.optimistic_or_unwind()?;
                if guard.state != BfState::Hot || guard.pid != expected_pid {
                    // The frame was recycled between resolve and latch.
                    guard.recheck()?;
                    return Err(error::Error::Unwind);
                }
                let mut guard = guard.to_exclusive_bf()?;
                guard.page.data_mut()[1] = value;
                Ok(())
            };
            if attempt().is_ok() {
                return;
            }
        }
    }
}

impl ManagedDataStructure for TestTree {
    fn iterate_children_swips<'a>(
        &self,
        needle: &dyn HybridGuard<BufferFrame, BufferFrame>,
        mut f: Box<dyn FnMut(&FrameSwip) -> error::Result<bool> + 'a>,
    ) -> error::Result<()> {
        if !std::ptr::eq(needle.latch(), self.root) {
            // Children are leaves.
            needle.recheck()?;
            return Ok(());
        }
        let bf = needle.inner();
        let len = child_count(bf);
        needle.recheck()?;
        for pos in 0..len {
            let swip = &swips(bf)[pos];
            if !f(swip)? {
                break;
            }
        }
        needle.recheck()?;
        Ok(())
    }

    fn find_parent(
        &self,
        needle: &dyn HybridGuard<BufferFrame, BufferFrame>,
    ) -> error::Result<ParentResult> {
        if std::ptr::eq(needle.latch(), self.root) {
            return Ok(ParentResult::Root);
        }

        let root_guard = self.root.optimistic_or_unwind()?;
        let len = child_count(&root_guard);
        root_guard.recheck()?;

        let mut found = None;
        for pos in 0..len {
            let swip = &swips(&root_guard)[pos];
            if let RefOrPid::Ref(r) = swip.downcast() {
                if std::ptr::eq(r, needle.latch()) {
                    found = Some(pos);
                    break;
                }
            }
            root_guard.recheck()?;
        }

        match found {
            Some(pos) => Ok(ParentResult::Parent(OptimisticGuard::map(
                root_guard,
                |bf| swip_ref(bf, pos),
            )?)),
            None => {
                // The swip changed hands mid-walk, let the caller retry.
                needle.recheck()?;
                Err(error::Error::Unwind)
            }
        }
    }
}
