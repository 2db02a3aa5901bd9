use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::error;
use crate::latch::HybridLatch;

use super::partition::Partition;
use super::registry::ParentResult;
use super::swip::{Pid, RefOrPid};
use super::write_buffer::AsyncWriteBuffer;
use super::{BfState, BufferFrame, BufferManager};

/// Per-thread state of the page provider. Tests drive rounds by hand through
/// it, the background thread loops until shutdown.
pub(crate) struct ProviderState {
    pub(crate) write_buffer: AsyncWriteBuffer,
    rng: SmallRng,
    free_pages_limit: usize,
    cooling_pages_limit: usize,
}

pub(crate) enum CoolOutcome {
    Cooled,
    /// A swizzled child was found, cool towards the leaves first.
    Descend(&'static HybridLatch<BufferFrame>),
}

impl BufferManager {
    pub(crate) fn provider_state(&self) -> ProviderState {
        ProviderState {
            write_buffer: AsyncWriteBuffer::new(
                &self.fd,
                self.page_size,
                self.options.async_batch_size,
            ),
            rng: SmallRng::from_entropy(),
            free_pages_limit: (self.options.free_pct * self.pool_size / 100).max(1),
            cooling_pages_limit: (self.options.cool_pct * self.pool_size / 100).max(1),
        }
    }

    fn random_frame(&'static self, rng: &mut SmallRng) -> &'static HybridLatch<BufferFrame> {
        &self.frames[rng.gen_range(0..self.pool_size)]
    }

    fn phase_1_condition(&self, state: &ProviderState) -> bool {
        self.free_count() + self.cooling_count() < state.cooling_pages_limit
    }

    /// One cool / evict / reap round.
    pub(crate) fn provider_round(&'static self, state: &mut ProviderState) {
        let phase_1_begin = Instant::now();

        // Phase 1: unswizzle hot frames into the cooling stage.
        let mut next_target: Option<&'static HybridLatch<BufferFrame>> = None;
        let mut attempts = 0;
        // Bounded so a round always terminates even when nothing is coolable.
        let max_attempts = 4 * self.pool_size;
        while self.phase_1_condition(state) && self.running() && attempts < max_attempts {
            attempts += 1;
            let latch = next_target
                .take()
                .unwrap_or_else(|| self.random_frame(&mut state.rng));
            match self.try_cool(latch) {
                Ok(CoolOutcome::Cooled) => {}
                Ok(CoolOutcome::Descend(child)) => next_target = Some(child),
                Err(_) => {}
            }
        }

        let phase_2_begin = Instant::now();

        // Phase 2: walk the cooling queues, evict clean frames, stage dirty
        // ones for writeback.
        let mut pages_left = state.free_pages_limit.saturating_sub(self.free_count());
        for partition in self.partitions.iter() {
            if pages_left == 0 {
                break;
            }
            pages_left = self.evict_from_partition(partition, pages_left, state);
        }

        let phase_3_begin = Instant::now();

        // Phase 3: reap completed writes.
        if state.write_buffer.pending() > 0 {
            state.write_buffer.submit();
            let polled = state.write_buffer.poll_events_sync();
            if polled > 0 {
                self.reap_writes(state, polled);
            }
        }

        let end = Instant::now();
        self.counters.phase_1_us.fetch_add(
            (phase_2_begin - phase_1_begin).as_micros() as u64,
            Ordering::Relaxed,
        );
        self.counters.phase_2_us.fetch_add(
            (phase_3_begin - phase_2_begin).as_micros() as u64,
            Ordering::Relaxed,
        );
        self.counters
            .phase_3_us
            .fetch_add((end - phase_3_begin).as_micros() as u64, Ordering::Relaxed);
        self.counters.pp_rounds.fetch_add(1, Ordering::Relaxed);
    }

    /// Tries to move one hot frame into the cooling stage.
    pub(crate) fn try_cool(
        &'static self,
        latch: &'static HybridLatch<BufferFrame>,
    ) -> error::Result<CoolOutcome> {
        let guard = latch.optimistic_or_unwind()?;
        let state = guard.state;
        let pid = guard.pid;
        let dtid = guard.page.dtid;
        guard.recheck()?;

        if state != BfState::Hot {
            return Err(error::Error::Unwind);
        }

        let dt = self.registry.get(dtid).ok_or(error::Error::Unwind)?;

        // An interior page is a poor eviction candidate while any child is
        // resident, follow the child instead.
        let mut picked_child = None;
        dt.iterate_children_swips(
            &guard,
            Box::new(|swip| {
                match swip.downcast() {
                    RefOrPid::Ref(child) => {
                        guard.recheck()?;
                        picked_child = Some(child);
                        Ok(false)
                    }
                    RefOrPid::Pid(_) => {
                        guard.recheck()?;
                        Ok(true)
                    }
                }
            }),
        )?;
        if let Some(child) = picked_child {
            return Ok(CoolOutcome::Descend(child));
        }

        let mut frame_x = guard.try_to_exclusive()?;
        let swip_guard = match dt.find_parent(&frame_x)? {
            // Roots stay resident.
            ParentResult::Root => return Err(error::Error::Unwind),
            ParentResult::Parent(swip_guard) => swip_guard,
        };
        let mut swip_x = swip_guard.try_to_exclusive()?;
        debug_assert!(match swip_x.downcast() {
            RefOrPid::Ref(r) => std::ptr::eq(r, latch),
            RefOrPid::Pid(_) => false,
        });

        let partition = self.partition(pid);
        let mut pstate = partition.lock();
        if pstate.has(pid) {
            // A faulting reader still owns a record for this pid, leave the
            // frame alone and pick another one.
            return Err(error::Error::Unwind);
        }

        pstate.insert_cooling(pid, latch);
        frame_x.state = BfState::Cold;
        frame_x.cooled_by_read.store(false, Ordering::Relaxed);
        swip_x.to_pid(pid);
        self.cooling_counter.fetch_add(1, Ordering::Relaxed);
        self.stats.unswizzled.fetch_add(1, Ordering::Relaxed);

        Ok(CoolOutcome::Cooled)
    }

    /// Examines up to `pages_left` frames from the front of the partition's
    /// cooling queue. Returns how many examinations remain for the next
    /// partition.
    pub(crate) fn evict_from_partition(
        &'static self,
        partition: &Partition,
        pages_left: usize,
        state: &mut ProviderState,
    ) -> usize {
        let mut pstate = partition.lock();
        let mut remaining = pages_left;

        let candidates: Vec<(Pid, &'static HybridLatch<BufferFrame>)> = pstate
            .cooling
            .iter()
            .take(remaining)
            .map(|(pid, latch)| (*pid, *latch))
            .collect();

        for (pid, latch) in candidates {
            remaining -= 1;

            // Cold frames are stable under the partition mutex.
            let frame = unsafe { &*latch.data_ptr() };
            if frame.writeback.load(Ordering::Acquire)
                || frame.cooled_by_read.load(Ordering::Acquire)
            {
                continue;
            }

            if frame.is_dirty() {
                if state.write_buffer.add(latch) {
                    self.counters.awrites_submitted.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters
                        .awrites_submit_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            } else {
                let mut frame_x = latch.exclusive();
                debug_assert_eq!(BfState::Cold, frame_x.state);
                debug_assert_eq!(pid, frame_x.pid);

                pstate.remove(pid);
                self.cooling_counter.fetch_sub(1, Ordering::Relaxed);

                frame_x.reset();
                let unlocked = frame_x.unlock();
                self.free_list.push(unlocked.latch());
                self.counters.evicted_pages.fetch_add(1, Ordering::Relaxed);
            }
        }

        remaining
    }

    /// Commits up to `n` completed writes: clears `writeback`, stores the
    /// persisted LSN and evicts frames that are still cold.
    pub(crate) fn reap_writes(&'static self, state: &mut ProviderState, n: usize) {
        let write_buffer = &mut state.write_buffer;
        write_buffer.collect(n, |latch, written_lsn| {
            // The pid is stable while `writeback` is set: such frames are
            // never freed or repurposed.
            let pid = unsafe { (*latch.data_ptr()).pid };
            let partition = self.partition(pid);
            let mut pstate = partition.lock();

            self.stats.flushed.fetch_add(1, Ordering::Relaxed);

            match latch.try_exclusive() {
                None => {
                    // The frame was swizzled back and some worker holds it,
                    // keep it in the pool and just commit the persisted LSN.
                    let frame = unsafe { &*latch.data_ptr() };
                    frame.last_written_lsn.store(written_lsn, Ordering::Release);
                    frame.writeback.store(false, Ordering::Release);
                }
                Some(mut frame_x) => {
                    debug_assert!(frame_x.writeback.load(Ordering::Acquire));
                    frame_x
                        .last_written_lsn
                        .store(written_lsn, Ordering::Release);
                    frame_x.writeback.store(false, Ordering::Release);

                    if frame_x.state == BfState::Cold {
                        pstate.remove(pid);
                        self.cooling_counter.fetch_sub(1, Ordering::Relaxed);

                        frame_x.reset();
                        let unlocked = frame_x.unlock();
                        self.free_list.push(unlocked.latch());
                        self.counters.evicted_pages.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            drop(pstate);
        });
    }

    /// Submits and reaps until no write is left in flight.
    pub(crate) fn provider_drain(&'static self, state: &mut ProviderState) {
        while state.write_buffer.pending() > 0 {
            state.write_buffer.submit();
            let polled = state.write_buffer.poll_events_sync();
            if polled > 0 {
                self.reap_writes(state, polled);
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Background loop: cool, evict, reap, until shutdown; then drain.
    pub(crate) fn page_provider_thread(&'static self) {
        let mut state = self.provider_state();
        while self.running() {
            let idle = !self.phase_1_condition(&state)
                && self.free_count() >= state.free_pages_limit
                && state.write_buffer.pending() == 0;
            if idle {
                std::thread::yield_now();
                continue;
            }
            self.provider_round(&mut state);
        }
        self.provider_drain(&mut state);
        log::debug!("page provider exiting");
        self.bg_threads_counter.fetch_sub(1, Ordering::AcqRel);
    }
}
