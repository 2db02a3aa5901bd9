use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{self, BufMgrError};
use crate::latch::{ExclusiveGuard, HybridLatch, OptimisticGuard};

pub mod registry;
pub mod swip;

pub(crate) mod free_list;
pub(crate) mod partition;
pub(crate) mod write_buffer;

mod latch_ext;
mod page_provider;

#[cfg(test)]
pub(crate) mod test_dt;
#[cfg(test)]
pub(crate) mod test_pool;

pub use latch_ext::{BfLatchExt, BfOptimisticGuardExt};

use free_list::FreeList;
use partition::{CioState, Partition};
use registry::{DataStructureId, Registry};
use swip::{Pid, RefOrPid, Swip};

const GIB: u64 = 1024 * 1024 * 1024;

/// All recognized buffer manager options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufMgrOptions {
    /// DRAM pool size in GiB, determines the number of frames.
    pub dram_gib: f64,
    /// Page size in bytes, power of two, at least 512.
    pub page_size: usize,
    /// Backing block device or file.
    pub ssd_path: PathBuf,
    /// Truncate the backing file on open.
    pub truncate: bool,
    /// Preallocate this many GiB by writing zeroed chunks before use.
    pub falloc_gib: u64,
    /// Free list low water target, percent of the pool.
    pub free_pct: usize,
    /// Cooling queue target, percent of the pool.
    pub cool_pct: usize,
    /// Max in-flight asynchronous writes.
    pub async_batch_size: usize,
    /// Number of partitions, power of two.
    pub partitions: usize,
    /// Enable the periodic stats log line.
    pub print_debug: bool,
    /// Open the backing file with `O_DIRECT`. Disable only for filesystems
    /// that reject it (e.g. tmpfs in tests).
    pub direct_io: bool,
}

impl Default for BufMgrOptions {
    fn default() -> BufMgrOptions {
        BufMgrOptions {
            dram_gib: 1.0,
            page_size: 4096,
            ssd_path: PathBuf::from("swipbuf.db"),
            truncate: false,
            falloc_gib: 0,
            free_pct: 10,
            cool_pct: 20,
            async_batch_size: 64,
            partitions: 1,
            print_debug: false,
            direct_io: true,
        }
    }
}

/// On-disk page image: fixed header followed by the payload bytes.
#[repr(C)]
pub struct Page {
    /// Bumped by writers on modification; equality with the frame's
    /// `last_written_lsn` means the page is clean.
    pub lsn: u64,
    /// Owning data structure.
    pub dtid: DataStructureId,
    capacity: u64,
    /// Self identifying check, equals the owning page id.
    magic_debugging_number: u64,
    data: (), // Payload starts at `addr_of(self.data)` for `self.capacity` bytes
}

impl Page {
    pub const HEADER_SIZE: usize = std::mem::size_of::<u64>() * 4;

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(self.data) as *const u8,
                self.capacity as usize,
            )
        }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                std::ptr::addr_of_mut!(self.data) as *mut u8,
                self.capacity as usize,
            )
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Copy, Clone)]
#[repr(C)]
pub enum BfState {
    /// On the free list, header meaningless apart from `next_free`.
    Free,
    /// Resident and referenced by exactly one swizzled parent swip.
    Hot,
    /// Resident but unswizzled, sits in one partition's cooling queue.
    Cold,
}

/// Frame header plus the page it currently hosts. Frames are allocated once
/// and never relocated, a frame's address is its identity.
#[repr(C)]
pub struct BufferFrame {
    pub(crate) state: BfState,
    pub(crate) pid: Pid,
    /// LSN of the last completed disk write of this page.
    pub(crate) last_written_lsn: AtomicU64,
    /// Set while an asynchronous write of the page is in flight.
    pub(crate) writeback: AtomicBool,
    /// Distinguishes fault-in cooling from eviction cooling: such frames are
    /// shielded from eviction until the last faulting reader acknowledged
    /// them.
    pub(crate) cooled_by_read: AtomicBool,
    /// Free list link, meaningful only in `Free` state.
    pub(crate) next_free: AtomicPtr<HybridLatch<BufferFrame>>,
    pub page: &'static mut Page,
}

unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

impl BufferFrame {
    #[inline]
    pub fn state(&self) -> BfState {
        self.state
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.page.lsn != self.last_written_lsn.load(Ordering::Acquire)
    }

    fn reset(&mut self) {
        self.state = BfState::Free;
        self.pid = Pid::INVALID;
        self.last_written_lsn.store(0, Ordering::Relaxed);
        self.writeback.store(false, Ordering::Relaxed);
        self.cooled_by_read.store(false, Ordering::Relaxed);
        self.next_free.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferFrame")
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("writeback", &self.writeback.load(Ordering::Relaxed))
            .field(
                "cooled_by_read",
                &self.cooled_by_read.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Cumulative lifetime counters, reported at shutdown.
#[derive(Debug, Default)]
pub struct Stats {
    pub swizzled: AtomicU64,
    pub unswizzled: AtomicU64,
    pub flushed: AtomicU64,
}

/// Counters drained by the periodic stats line.
#[derive(Debug, Default)]
pub struct DebugCounters {
    pub phase_1_us: AtomicU64,
    pub phase_2_us: AtomicU64,
    pub phase_3_us: AtomicU64,
    pub evicted_pages: AtomicU64,
    pub awrites_submitted: AtomicU64,
    pub awrites_submit_failed: AtomicU64,
    pub pp_rounds: AtomicU64,
    pub io_reads: AtomicU64,
}

pub type OptSwipGuard<'a> = OptimisticGuard<'a, Swip<HybridLatch<BufferFrame>>, BufferFrame>;
pub type ExvSwipGuard<'a> = ExclusiveGuard<'a, Swip<HybridLatch<BufferFrame>>, BufferFrame>;

pub struct BufferManager {
    fd: std::fs::File,
    options: BufMgrOptions,
    page_size: usize,
    pool_size: usize,
    frames: Vec<HybridLatch<BufferFrame>>,
    free_list: FreeList,
    partitions: Vec<Partition>,
    partition_mask: u64,
    cooling_counter: AtomicUsize,
    ssd_used_pages_counter: AtomicU64,
    registry: Registry,
    running: AtomicBool,
    bg_threads_counter: AtomicUsize,
    pub stats: Stats,
    pub counters: DebugCounters,
}

impl BufferManager {
    pub fn new(options: BufMgrOptions) -> Result<BufferManager, BufMgrError> {
        let page_size = options.page_size;
        if !page_size.is_power_of_two() || page_size < 512 {
            return Err(BufMgrError::InvalidConfig(
                "page_size must be a power of two >= 512",
            ));
        }
        if !options.partitions.is_power_of_two() {
            return Err(BufMgrError::InvalidConfig(
                "partitions must be a power of two",
            ));
        }
        if options.async_batch_size == 0 {
            return Err(BufMgrError::InvalidConfig("async_batch_size must be > 0"));
        }

        let pool_bytes = (options.dram_gib * GIB as f64) as usize;
        let pool_size = pool_bytes / page_size;
        if pool_size == 0 {
            return Err(BufMgrError::InvalidConfig(
                "dram_gib too small for a single page",
            ));
        }

        let fd = {
            use std::os::unix::fs::OpenOptionsExt;
            let mut open_options = std::fs::OpenOptions::new();
            open_options.read(true).write(true).create(true);
            if options.truncate {
                open_options.truncate(true);
            }
            if options.direct_io {
                open_options.custom_flags(nix::libc::O_DIRECT);
            }
            open_options.open(&options.ssd_path)?
        };

        if options.falloc_gib > 0 {
            use nix::sys::uio::pwrite;
            use std::os::unix::io::AsRawFd;

            let chunk = GIB as usize;
            let (offset, storage) = write_buffer::aligned_boxed_slice(chunk, 512);
            let zeroes = &storage[offset..offset + chunk];
            for i in 0..options.falloc_gib {
                let n = pwrite(fd.as_raw_fd(), zeroes, (i * GIB) as i64)?;
                if n != chunk {
                    return Err(BufMgrError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "short write during preallocation",
                    )));
                }
            }
            nix::unistd::fsync(fd.as_raw_fd())?;
        }

        let addr = unsafe {
            nix::sys::mman::mmap(
                std::ptr::null_mut(),
                pool_size * page_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        // O_DIRECT does not work with forking, and the pool benefits from
        // huge pages where the kernel grants them.
        let _ = unsafe {
            nix::sys::mman::madvise(addr, pool_size * page_size, MmapAdvise::MADV_HUGEPAGE)
        };
        unsafe {
            nix::sys::mman::madvise(addr, pool_size * page_size, MmapAdvise::MADV_DONTFORK)?;
        }
        assert!((addr as usize) % page_size == 0);

        let mut frames = Vec::with_capacity(pool_size);
        for frame_idx in 0..pool_size {
            let page_ptr = unsafe { (addr as *mut u8).add(frame_idx * page_size) } as *mut Page;
            let page_ref: &'static mut Page = unsafe { &mut *page_ptr };
            page_ref.capacity = (page_size - Page::HEADER_SIZE) as u64;

            frames.push(HybridLatch::new(BufferFrame {
                state: BfState::Free,
                pid: Pid::INVALID,
                last_written_lsn: AtomicU64::new(0),
                writeback: AtomicBool::new(false),
                cooled_by_read: AtomicBool::new(false),
                next_free: AtomicPtr::new(ptr::null_mut()),
                page: page_ref,
            }));
        }

        let n_partitions = options.partitions.max(1);
        let cooling_upper_bound = (options.cool_pct * pool_size * 3 / 2) / 100;
        let partition_capacity = cooling_upper_bound / n_partitions + 1;
        let partitions = (0..n_partitions)
            .map(|_| Partition::new(partition_capacity))
            .collect();

        Ok(BufferManager {
            fd,
            page_size,
            pool_size,
            frames,
            free_list: FreeList::new(),
            partitions,
            partition_mask: (n_partitions - 1) as u64,
            cooling_counter: AtomicUsize::new(0),
            ssd_used_pages_counter: AtomicU64::new(0),
            registry: Registry::new(),
            running: AtomicBool::new(true),
            bg_threads_counter: AtomicUsize::new(0),
            stats: Stats::default(),
            counters: DebugCounters::default(),
            options,
        })
    }

    /// Builds a manager with a `'static` lifetime and a filled free list.
    /// Background threads are started separately.
    pub fn new_leaked(options: BufMgrOptions) -> Result<&'static BufferManager, BufMgrError> {
        let bufmgr: &'static BufferManager = Box::leak(Box::new(BufferManager::new(options)?));
        bufmgr.init();
        Ok(bufmgr)
    }

    /// Hands every frame to the free list. Must run once before first use.
    pub fn init(&'static self) {
        for frame in self.frames.iter() {
            self.free_list.push(frame);
        }
    }

    pub fn start_background_threads(&'static self) {
        self.running.store(true, Ordering::Release);

        self.bg_threads_counter.fetch_add(1, Ordering::AcqRel);
        std::thread::Builder::new()
            .name("page_provider".into())
            .spawn(move || self.page_provider_thread())
            .expect("failed to spawn page provider");

        self.bg_threads_counter.fetch_add(1, Ordering::AcqRel);
        std::thread::Builder::new()
            .name("bm_stats".into())
            .spawn(move || self.stats_thread())
            .expect("failed to spawn stats thread");
    }

    /// Signals shutdown and spins until every background thread has observed
    /// the flag and exited. In-flight writes are drained, not abandoned.
    pub fn stop_background_threads(&self) {
        self.running.store(false, Ordering::Release);
        while self.bg_threads_counter.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of pages handed out on the backing device so far.
    pub fn consumed_pages(&self) -> u64 {
        self.ssd_used_pages_counter.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn free_count(&self) -> usize {
        self.free_list.counter()
    }

    #[inline]
    pub(crate) fn cooling_count(&self) -> usize {
        self.cooling_counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Frames the free list must hold before loads and allocations are
    /// allowed to take one. Scaled down for miniature pools.
    #[inline]
    pub(crate) fn free_low_water(&self) -> usize {
        (self.pool_size / 10).clamp(1, 10)
    }

    #[inline]
    pub(crate) fn partition(&self, pid: Pid) -> &Partition {
        &self.partitions[(pid.page_id() & self.partition_mask) as usize]
    }

    // Pids are never reused: a retired pid's slot still holds the old page
    // bytes with a matching debug number, which would satisfy the post-read
    // identity check and smuggle stale content under a recycled identity.
    // A fresh pid's slot fails that check loudly instead.
    fn next_pid(&self) -> Pid {
        Pid::new(self.ssd_used_pages_counter.fetch_add(1, Ordering::AcqRel))
    }

    /// Reads one page synchronously into `page`, retrying short reads until
    /// the full page is populated.
    pub(crate) fn read_page_sync(&self, pid: Pid, page: &mut Page) -> Result<(), BufMgrError> {
        use nix::sys::uio::pread;
        use std::os::unix::io::AsRawFd;

        let size = self.page_size;
        let slice = unsafe { std::slice::from_raw_parts_mut(page as *mut _ as *mut u8, size) };
        assert!(slice.as_ptr() as usize % 512 == 0);

        let mut bytes_left = size;
        while bytes_left > 0 {
            let done = size - bytes_left;
            let n = pread(
                self.fd.as_raw_fd(),
                &mut slice[done..],
                (pid.byte_offset(size) + done as u64) as i64,
            )?;
            if n == 0 {
                return Err(BufMgrError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "no bytes read",
                )));
            }
            bytes_left -= n;
        }
        self.counters.io_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns a new exclusively latched `Hot` frame with a fresh pid.
    ///
    /// Unwinds when the pool is at its low water mark; callers retry after
    /// the page provider has replenished the free list.
    pub fn allocate_page_for(
        &'static self,
        dtid: DataStructureId,
    ) -> error::Result<ExclusiveGuard<'static, BufferFrame>> {
        if self.free_list.counter() < self.free_low_water() {
            return Err(error::Error::Unwind);
        }
        let free_latch = self.free_list.pop()?;
        let pid = self.next_pid();

        let mut frame = free_latch.exclusive();
        assert_eq!(BfState::Free, frame.state);
        frame.pid = pid;
        frame.state = BfState::Hot;
        frame.last_written_lsn.store(0, Ordering::Relaxed);
        frame.page.lsn = 0;
        frame.page.dtid = dtid;
        frame.page.magic_debugging_number = pid.page_id();
        frame.page.capacity = (self.page_size - Page::HEADER_SIZE) as u64;

        Ok(frame)
    }

    /// Returns a frame to the free list. The pid is retired, not reused.
    pub fn reclaim_page(&self, mut frame: ExclusiveGuard<'static, BufferFrame>) {
        // A frame with an in-flight write must stay out of the free list
        // until the provider has collected the completion.
        while frame.writeback.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        frame.reset();
        let unlocked = frame.unlock();
        self.free_list.push(unlocked.latch());
    }

    /// Fast path of [`BufferManager::resolve_swip`]: a swizzled swip costs
    /// one recheck.
    #[inline]
    pub fn resolve_swip_fast(
        &'static self,
        swip_guard: OptSwipGuard<'static>,
    ) -> error::Result<(OptSwipGuard<'static>, &'static HybridLatch<BufferFrame>)> {
        match swip_guard.downcast() {
            RefOrPid::Ref(latch) => {
                swip_guard.recheck()?;
                Ok((swip_guard, latch))
            }
            RefOrPid::Pid(_) => self.resolve_swip(swip_guard),
        }
    }

    /// Turns a swip into a frame reference.
    ///
    /// The only API through which workers reach pages: swizzled swips return
    /// immediately, everything else coordinates through the pid's partition.
    /// A fault-in schedules the load and unwinds, the retrying caller then
    /// finds the page in the cooling stage and swizzles it back.
    pub fn resolve_swip(
        &'static self,
        swip_guard: OptSwipGuard<'static>,
    ) -> error::Result<(OptSwipGuard<'static>, &'static HybridLatch<BufferFrame>)> {
        let pid = match swip_guard.downcast() {
            RefOrPid::Ref(latch) => {
                swip_guard.recheck()?;
                return Ok((swip_guard, latch));
            }
            RefOrPid::Pid(pid) => pid,
        };
        swip_guard.recheck()?;

        let partition = self.partition(pid);
        let mut state = partition.lock();
        swip_guard.recheck()?;

        let found = state
            .map
            .get(&pid)
            .map(|cio| (cio.state, Arc::clone(&cio.shared)));

        match found {
            None => {
                // Fault: schedule the load ourselves.
                let low_water = self.free_low_water();
                if self.free_list.counter() < low_water {
                    drop(state);
                    self.free_list.spin_until_at_least(low_water);
                    return Err(error::Error::Unwind);
                }
                let free_latch = self.free_list.pop()?;

                let shared = state.insert_reading(pid);
                let gate = shared.gate.lock();
                let mut frame = free_latch.exclusive();
                drop(state);

                self.read_page_sync(pid, frame.page)
                    .expect("failed to read page");
                assert_eq!(pid.page_id(), frame.page.magic_debugging_number);

                frame
                    .last_written_lsn
                    .store(frame.page.lsn, Ordering::Relaxed);
                frame.state = BfState::Cold;
                frame.writeback.store(false, Ordering::Relaxed);
                frame.cooled_by_read.store(true, Ordering::Relaxed);
                frame.pid = pid;

                let mut state = partition.lock();
                state.promote_to_cooling(pid, free_latch);
                self.cooling_counter.fetch_add(1, Ordering::Relaxed);
                drop(frame);
                drop(state);
                drop(gate);

                // The caller restarts from its entry point; the retry finds
                // the page cooling and swizzles it in.
                Err(error::Error::Unwind)
            }
            Some((CioState::Reading, shared)) => {
                // Another thread is mid load, coalesce with it.
                shared.readers.fetch_add(1, Ordering::AcqRel);
                drop(state);

                drop(shared.gate.lock());

                if shared.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut state = partition.lock();
                    let still_ours = state
                        .map
                        .get(&pid)
                        .map_or(false, |cio| Arc::ptr_eq(&cio.shared, &shared));
                    if still_ours && shared.readers.load(Ordering::Acquire) == 0 {
                        state.remove(pid);
                    }
                }
                Err(error::Error::Unwind)
            }
            Some((CioState::Cooling, shared)) => {
                let frame_latch = *state.cooling.get(&pid).expect("cooling entry has a frame");

                // Never block on a latch while holding the partition mutex.
                let mut swip_x = swip_guard.try_to_exclusive()?;
                // Cold frame latches are uncontended, everyone touching them
                // goes through this partition mutex first.
                let mut frame = frame_latch.exclusive();
                assert_eq!(pid, frame.pid);
                assert_eq!(BfState::Cold, frame.state);

                swip_x.to_ref(frame_latch);
                state.unqueue(pid);
                self.cooling_counter.fetch_sub(1, Ordering::Relaxed);
                // Hot only after the swizzle is in place.
                frame.state = BfState::Hot;

                let mut should_clean = true;
                if frame.cooled_by_read.load(Ordering::Relaxed) {
                    if shared.readers.fetch_sub(1, Ordering::AcqRel) > 1 {
                        // Late waiters still hold the record, the last of
                        // them removes it.
                        should_clean = false;
                    }
                    frame.cooled_by_read.store(false, Ordering::Relaxed);
                }
                if should_clean {
                    state.remove(pid);
                }

                self.stats.swizzled.fetch_add(1, Ordering::Relaxed);
                drop(frame);
                drop(state);

                Ok((swip_x.unlock(), frame_latch))
            }
        }
    }

    /// Synchronously writes back every dirty resident page. Callers must
    /// guarantee quiescence (no workers, no background threads).
    pub fn write_all_buffer_frames(&self) {
        use nix::sys::uio::pwrite;
        use std::os::unix::io::AsRawFd;

        for latch in self.frames.iter() {
            let frame = latch.shared();
            if frame.state != BfState::Free && frame.is_dirty() {
                let size = self.page_size;
                let page: &Page = &*frame.page;
                let slice =
                    unsafe { std::slice::from_raw_parts(page as *const _ as *const u8, size) };
                let n = pwrite(
                    self.fd.as_raw_fd(),
                    slice,
                    frame.pid.byte_offset(size) as i64,
                )
                .expect("failed to write page");
                assert_eq!(size, n);
                frame.last_written_lsn.store(page.lsn, Ordering::Release);
                self.stats.flushed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn fdatasync(&self) {
        use std::os::unix::io::AsRawFd;
        nix::unistd::fdatasync(self.fd.as_raw_fd()).expect("fdatasync failed");
    }

    /// Stops background work and flushes all resident dirty pages.
    pub fn persist(&self) {
        self.stop_background_threads();
        self.write_all_buffer_frames();
        self.fdatasync();
        self.log_stats();
    }

    /// Reserved lifecycle hook, the catalog is not reloaded.
    pub fn restore(&self) {}

    pub(crate) fn log_stats(&self) {
        log::info!(
            "buffer manager stats: swizzled={} unswizzled={} flushed={}",
            self.stats.swizzled.load(Ordering::Relaxed),
            self.stats.unswizzled.load(Ordering::Relaxed),
            self.stats.flushed.load(Ordering::Relaxed),
        );
    }

    /// 1 Hz counter line, enabled by `print_debug`.
    pub(crate) fn stats_thread(&'static self) {
        while self.options.print_debug && self.running() {
            let p1 = self.counters.phase_1_us.swap(0, Ordering::Relaxed);
            let p2 = self.counters.phase_2_us.swap(0, Ordering::Relaxed);
            let p3 = self.counters.phase_3_us.swap(0, Ordering::Relaxed);
            let total = p1 + p2 + p3;
            if total > 0 {
                log::info!(
                    "p1:{} p2:{} p3:{} f:{} c:{} e:{} as:{} af:{} pr:{}",
                    p1 * 100 / total,
                    p2 * 100 / total,
                    p3 * 100 / total,
                    self.free_count(),
                    self.cooling_count(),
                    self.counters.evicted_pages.swap(0, Ordering::Relaxed),
                    self.counters.awrites_submitted.swap(0, Ordering::Relaxed),
                    self.counters
                        .awrites_submit_failed
                        .swap(0, Ordering::Relaxed),
                    self.counters.pp_rounds.swap(0, Ordering::Relaxed),
                );
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        self.bg_threads_counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.stop_background_threads();
        self.log_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::page_provider::CoolOutcome;
    use super::test_dt::{swips, TestTree};
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::Ordering;

    fn test_manager_with<F>(pool_pages: usize, configure: F) -> &'static BufferManager
    where
        F: FnOnce(&mut BufMgrOptions),
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.db");
        // The leaked manager outlives the test, keep its backing file around.
        std::mem::forget(dir);

        let mut options = BufMgrOptions {
            dram_gib: (pool_pages * 4096) as f64 / GIB as f64,
            page_size: 4096,
            ssd_path: path,
            truncate: true,
            direct_io: false,
            ..BufMgrOptions::default()
        };
        configure(&mut options);
        BufferManager::new_leaked(options).expect("manager")
    }

    fn test_manager(pool_pages: usize) -> &'static BufferManager {
        test_manager_with(pool_pages, |_| {})
    }

    fn cool_child(mgr: &'static BufferManager, latch: &'static HybridLatch<BufferFrame>) {
        match mgr.try_cool(latch) {
            Ok(CoolOutcome::Cooled) => {}
            _ => panic!("uncontended cooling should succeed"),
        }
    }

    fn frame_state(latch: &'static HybridLatch<BufferFrame>) -> BfState {
        let guard = latch.optimistic_or_spin();
        let state = guard.state;
        guard.recheck().expect("no writers in sight");
        state
    }

    #[test]
    fn rejects_bad_options() {
        let options = BufMgrOptions {
            page_size: 1000,
            ..BufMgrOptions::default()
        };
        assert!(matches!(
            BufferManager::new(options),
            Err(BufMgrError::InvalidConfig(_))
        ));

        let options = BufMgrOptions {
            partitions: 3,
            ..BufMgrOptions::default()
        };
        assert!(matches!(
            BufferManager::new(options),
            Err(BufMgrError::InvalidConfig(_))
        ));
    }

    #[test]
    fn allocate_and_reclaim_recycles_frame_but_not_pid() {
        let mgr = test_manager(16);
        let free_before = mgr.free_count();

        let frame = mgr.allocate_page_for(7).expect("allocates");
        assert_eq!(BfState::Hot, frame.state);
        assert_eq!(7, frame.page.dtid);
        let pid = frame.pid;
        assert_eq!(pid.page_id(), frame.page.magic_debugging_number);
        assert_eq!(free_before - 1, mgr.free_count());

        mgr.reclaim_page(frame);
        assert_eq!(free_before, mgr.free_count());

        // The frame comes back, the pid is retired for good.
        let frame = mgr.allocate_page_for(7).expect("allocates");
        assert!(frame.pid > pid);
        assert_eq!(2, mgr.consumed_pages());
        mgr.reclaim_page(frame);
    }

    #[test]
    fn resolve_of_swizzled_swip_is_idempotent() {
        let mgr = test_manager(64);
        let tree = TestTree::create(mgr, 4);

        let first = tree.resolve_child(2);
        let second = tree.resolve_child(2);
        assert!(std::ptr::eq(first, second));
        assert_eq!(BfState::Hot, frame_state(first));
        assert_eq!((2, 0), tree.read_child(2));
        assert_eq!(0, mgr.counters.io_reads.load(Ordering::Relaxed));
    }

    #[test]
    fn cool_then_resolve_swizzles_back_without_io() {
        let mgr = test_manager(64);
        let tree = TestTree::create(mgr, 4);

        let child = tree.resolve_child(1);
        cool_child(mgr, child);

        assert_eq!(1, mgr.cooling_count());
        assert_eq!(BfState::Cold, frame_state(child));
        {
            let root_guard = tree.root.optimistic_or_spin();
            let swip = &swips(&root_guard)[1];
            assert!(swip.is_pid());
            root_guard.recheck().expect("quiescent");
        }

        let resolved = tree.resolve_child(1);
        assert!(std::ptr::eq(child, resolved));
        assert_eq!(BfState::Hot, frame_state(child));
        assert_eq!(0, mgr.cooling_count());
        assert_eq!(0, mgr.counters.io_reads.load(Ordering::Relaxed));
        assert_eq!(1, mgr.stats.unswizzled.load(Ordering::Relaxed));
        assert_eq!(1, mgr.stats.swizzled.load(Ordering::Relaxed));
        assert_eq!((1, 0), tree.read_child(1));
    }

    #[test]
    fn evicted_page_round_trips_through_disk() {
        let mgr = test_manager_with(64, |options| {
            options.free_pct = 100;
            options.cool_pct = 100;
        });
        let tree = TestTree::create(mgr, 3);
        tree.write_child(0, 0xAB);

        let child = tree.resolve_child(0);
        cool_child(mgr, child);

        let mut provider = mgr.provider_state();
        let mut rounds = 0;
        while frame_state(child) != BfState::Free {
            mgr.provider_round(&mut provider);
            std::thread::sleep(std::time::Duration::from_millis(1));
            rounds += 1;
            assert!(rounds < 1000, "provider failed to evict the cooled frame");
        }

        let reads_before = mgr.counters.io_reads.load(Ordering::Relaxed);
        assert_eq!((0, 0xAB), tree.read_child(0));
        assert_eq!(
            reads_before + 1,
            mgr.counters.io_reads.load(Ordering::Relaxed)
        );

        // Resident again: further reads stay in memory.
        assert_eq!((0, 0xAB), tree.read_child(0));
        assert_eq!(
            reads_before + 1,
            mgr.counters.io_reads.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn reswizzled_frame_survives_inflight_writeback() {
        let mgr = test_manager(64);
        let tree = TestTree::create(mgr, 2);
        tree.write_child(0, 0x42);

        let child = tree.resolve_child(0);
        let written_lsn = {
            let guard = child.optimistic_or_spin();
            let lsn = guard.page.lsn;
            guard.recheck().expect("quiescent");
            lsn
        };
        cool_child(mgr, child);
        let pid = tree.child_pid(0);

        let mut provider = mgr.provider_state();
        let free_before = mgr.free_count();
        mgr.evict_from_partition(mgr.partition(pid), 4, &mut provider);
        assert_eq!(
            1,
            mgr.counters.awrites_submitted.load(Ordering::Relaxed)
        );
        assert!(unsafe { &*child.data_ptr() }.writeback.load(Ordering::Acquire));
        assert_eq!(1, mgr.cooling_count());

        // Re-swizzle while the write is in flight.
        let resolved = tree.resolve_child(0);
        assert!(std::ptr::eq(child, resolved));
        assert_eq!(BfState::Hot, frame_state(child));

        provider.write_buffer.submit();
        let mut polled = provider.write_buffer.poll_events_sync();
        while polled == 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            polled = provider.write_buffer.poll_events_sync();
        }
        mgr.reap_writes(&mut provider, polled);

        let frame = unsafe { &*child.data_ptr() };
        assert_eq!(BfState::Hot, frame_state(child));
        assert!(!frame.writeback.load(Ordering::Acquire));
        assert_eq!(written_lsn, frame.last_written_lsn.load(Ordering::Acquire));
        assert_eq!(free_before, mgr.free_count());
        assert_eq!(1, mgr.stats.flushed.load(Ordering::Relaxed));
        assert_eq!(0, mgr.counters.evicted_pages.load(Ordering::Relaxed));
        assert_eq!((0, 0x42), tree.read_child(0));
    }

    #[test]
    fn cooling_descends_into_swizzled_children() {
        let mgr = test_manager(64);
        let tree = TestTree::create(mgr, 3);

        match mgr.try_cool(tree.root) {
            Ok(CoolOutcome::Descend(child)) => {
                cool_child(mgr, child);
            }
            _ => panic!("expected to descend into a resident child"),
        }

        // The root is untouched, exactly one child was unswizzled.
        assert_eq!(BfState::Hot, frame_state(tree.root));
        assert_eq!(1, mgr.cooling_count());
        assert_eq!(1, mgr.stats.unswizzled.load(Ordering::Relaxed));
    }

    #[test]
    fn exhausted_pool_recovers_through_provider() {
        let mgr = test_manager_with(4, |options| {
            options.free_pct = 100;
            options.cool_pct = 100;
        });
        let tree = TestTree::create(mgr, 3);
        assert_eq!(0, mgr.free_count());

        // No frame available: allocation must signal a restart.
        assert!(mgr.allocate_page_for(tree.dtid).is_err());

        let mut provider = mgr.provider_state();
        let mut allocated = None;
        for _ in 0..1000 {
            mgr.provider_round(&mut provider);
            std::thread::sleep(std::time::Duration::from_millis(1));
            if let Ok(frame) = mgr.allocate_page_for(tree.dtid) {
                allocated = Some(frame);
                break;
            }
        }
        let frame = allocated.expect("provider should free a frame");
        mgr.reclaim_page(frame);
    }

    #[test]
    #[serial]
    fn concurrent_faults_coalesce_into_one_read() {
        let mgr = test_manager_with(64, |options| {
            options.free_pct = 100;
            options.cool_pct = 100;
        });
        let tree = TestTree::create(mgr, 2);
        tree.write_child(0, 0x77);

        let child = tree.resolve_child(0);
        cool_child(mgr, child);

        let mut provider = mgr.provider_state();
        let mut rounds = 0;
        while frame_state(child) != BfState::Free {
            mgr.provider_round(&mut provider);
            std::thread::sleep(std::time::Duration::from_millis(1));
            rounds += 1;
            assert!(rounds < 1000, "provider failed to evict the cooled frame");
        }

        let reads_before = mgr.counters.io_reads.load(Ordering::Relaxed);
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let tree = std::sync::Arc::clone(&tree);
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tree.resolve_child(0)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(std::ptr::eq(results[0], results[1]));
        assert_eq!(
            reads_before + 1,
            mgr.counters.io_reads.load(Ordering::Relaxed)
        );
        assert_eq!((0, 0x77), tree.read_child(0));
    }

    #[test]
    fn shutdown_drain_completes_inflight_writes() {
        // Two partitions so the walk over the cooling queues is exercised.
        let mgr = test_manager_with(64, |options| {
            options.partitions = 2;
        });
        let tree = TestTree::create(mgr, 3);
        for pos in 0..3 {
            tree.write_child(pos, 0xC0 + pos as u8);
            let child = tree.resolve_child(pos);
            cool_child(mgr, child);
        }

        let mut provider = mgr.provider_state();
        let free_before = mgr.free_count();
        for partition in mgr.partitions.iter() {
            mgr.evict_from_partition(partition, 8, &mut provider);
        }
        assert_eq!(
            3,
            mgr.counters.awrites_submitted.load(Ordering::Relaxed)
        );
        assert_eq!(3, provider.write_buffer.pending());

        mgr.provider_drain(&mut provider);

        assert_eq!(0, provider.write_buffer.pending());
        assert_eq!(3, mgr.stats.flushed.load(Ordering::Relaxed));
        assert_eq!(3, mgr.counters.evicted_pages.load(Ordering::Relaxed));
        assert_eq!(free_before + 3, mgr.free_count());
        assert_eq!(0, mgr.cooling_count());

        // The flushed bytes come back bit identical.
        for pos in 0..3 {
            assert_eq!((pos as u8, 0xC0 + pos as u8), tree.read_child(pos));
        }
    }

    #[test]
    fn background_threads_start_and_stop() {
        let mgr = test_manager(64);
        mgr.start_background_threads();
        std::thread::sleep(std::time::Duration::from_millis(20));
        mgr.stop_background_threads();
    }

    #[test]
    #[serial]
    fn random_workload_keeps_counters_and_content_sane() {
        let _ = env_logger::builder().is_test(true).try_init();

        let n_children = 24usize;
        // Deliberately smaller than the working set to keep the provider busy.
        let mgr = test_manager_with(16, |options| {
            options.free_pct = 20;
            options.cool_pct = 40;
        });
        mgr.start_background_threads();

        let tree = TestTree::create(mgr, n_children);

        let n_threads = 4;
        let ops_per_thread = 2000;
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(n_threads));
        let handles: Vec<_> = (0..n_threads)
            .map(|t| {
                let tree = std::sync::Arc::clone(&tree);
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    use rand::Rng;
                    let mut rng = rand::thread_rng();
                    barrier.wait();
                    for op in 0..ops_per_thread {
                        let pos = rng.gen_range(0..n_children);
                        if op % 5 == 0 {
                            tree.write_child(pos, (t * 31 + op) as u8);
                        } else {
                            let (stamp, _value) = tree.read_child(pos);
                            assert_eq!(pos as u8, stamp);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Verify while the provider still relieves pool pressure.
        for pos in 0..n_children {
            let (stamp, _value) = tree.read_child(pos);
            assert_eq!(pos as u8, stamp);
        }

        mgr.stop_background_threads();

        assert!(mgr.free_count() + mgr.cooling_count() <= mgr.pool_size());
        assert!(mgr.stats.unswizzled.load(Ordering::Relaxed) > 0);
        assert!(mgr.stats.swizzled.load(Ordering::Relaxed) > 0);
        assert!(mgr.stats.flushed.load(Ordering::Relaxed) > 0);
        assert!(mgr.counters.io_reads.load(Ordering::Relaxed) > 0);
    }
}
