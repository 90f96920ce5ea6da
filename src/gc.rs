//! Collector orchestration (4.K): owns every shared inventory and drives
//! the phase/marker/sweeper/clearing loop. Mirrors `include/gc.hpp`'s
//! `gc<Policy, Tracer>` class, generalized to Rust generics over the
//! `Policy`/`Tracer` capability traits instead of C++ template
//! parameters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atomic::Atomic;
use parking_lot::{Condvar, Mutex};

use crate::barrier::SharedBufferSet;
use crate::color::Color;
use crate::config::{SMALL_SIZE_CLASSES, SMALL_SIZE_CLASS_BASE_SHIFT};
use crate::header::header_of;
use crate::internal::atomic_list::ListLink;
use crate::internal::large_block::{LargeBlock, SharedLargeBlockList};
use crate::internal::node_pool::AllocationDump;
use crate::internal::policy::Policy;
use crate::internal::stub_list::SharedStubList;
use crate::internal::trace::Tracer;
use crate::marker::Marker;
use crate::mutator::Mutator;
use crate::phase::{Phase, PhaseState};
use crate::sweeper::{sweep_large_class, sweep_small_class};

/// The process-wide (but explicitly handled, not ambient-global per 9.)
/// collector. Owns every shared inventory a registered `Mutator` drains
/// into and refills from.
pub struct Gc {
    pub(crate) phase: PhaseState,
    alloc_color: Atomic<Color>,
    pub(crate) small_used: Vec<SharedStubList>,
    pub(crate) small_free: Vec<SharedStubList>,
    pub(crate) large_used: SharedLargeBlockList,
    pub(crate) large_free: SharedLargeBlockList,
    pub(crate) root_set: SharedBufferSet,
    pub(crate) buffer_set: SharedBufferSet,
    pub(crate) allocation_dump: AllocationDump,
    running: AtomicBool,
    idle: Mutex<()>,
    idle_cv: Condvar,
    cycles: AtomicUsize,
}

impl Gc {
    pub fn new() -> Arc<Gc> {
        Arc::new(Gc {
            phase: PhaseState::new(),
            alloc_color: Atomic::new(Color::Black),
            small_used: (0..SMALL_SIZE_CLASSES).map(|_| SharedStubList::new()).collect(),
            small_free: (0..SMALL_SIZE_CLASSES).map(|_| SharedStubList::new()).collect(),
            large_used: SharedLargeBlockList::new(),
            large_free: SharedLargeBlockList::new(),
            root_set: SharedBufferSet::new(),
            buffer_set: SharedBufferSet::new(),
            allocation_dump: AllocationDump::new(),
            running: AtomicBool::new(true),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            cycles: AtomicUsize::new(0),
        })
    }

    pub fn alloc_color(&self) -> Color {
        self.alloc_color.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        self.phase.phase()
    }

    /// Number of full `Sweep -> First` wrap-arounds this collector has
    /// completed, for `stats.rs`'s `HeapStatistics::cycles_completed`.
    pub fn cycles_completed(&self) -> usize {
        self.cycles.load(Ordering::Acquire)
    }

    pub fn get_mutator(self: &Arc<Self>) -> Mutator {
        Mutator::new(Arc::clone(self))
    }

    /// Requests graceful termination. `run`'s loop exits after finishing
    /// whatever dispatch it's in the middle of.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.idle_cv.notify_all();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wakes a collector parked in `run`'s busy-wait once a mutator's
    /// `poll_for_sync` brings `shook` up to `active`. Per 9.'s design
    /// note, this substitutes the condition-variable alternative for
    /// spinning.
    pub(crate) fn notify_shaken(&self) {
        self.idle_cv.notify_all();
    }

    /// Attempts to advance the phase. Per 4.F: compare `shook` to
    /// `active`; if equal, take `reg_mut`, re-check under the lock, flip
    /// `alloc_color` iff leaving `Second`, then advance and reset `shook`.
    pub(crate) fn try_advance(&self) -> Option<Phase> {
        if !self.phase.all_shaken() {
            return None;
        }
        self.phase.with_reg_lock(|| {
            if !self.phase.all_shaken() {
                return None;
            }
            let leaving = self.phase.phase();
            let next = self.phase.advance_locked();
            if leaving == Phase::Second {
                let cur = self.alloc_color.load(Ordering::Acquire);
                self.alloc_color.store(cur.flip(), Ordering::Release);
            }
            Some(next)
        })
    }

    /// Walks `buffer_set`, and for each sentinel-tagged entry zeros every
    /// segment log-pointer slot of the object it names. Dispatched
    /// whenever `try_advance` lands the phase on `First` — see
    /// DESIGN.md's Open Question #4 on why that's the wrap-around
    /// transition rather than a separate `Clearing` phase value.
    unsafe fn clear_buffers<T: Tracer>(&self, tracer: &T) {
        // Entries here are carved from some mutator's node pool, never
        // individually heap-allocated — their storage is released only
        // when that mutator's whole slab is dumped at detach, so this
        // walk reads each node without taking ownership of it.
        let mut cur = self.buffer_set.vacate();
        while !cur.is_null() {
            let node = &*cur;
            if node.is_sentinel() {
                let obj = node.untagged_ptr();
                let header = header_of(obj);
                let n = tracer.num_log_ptrs(header);
                for seg in 0..n {
                    let lp = tracer.log_ptr(header, obj, seg) as *mut AtomicUsize;
                    (*lp).store(0, Ordering::Release);
                }
            }
            cur = node.next_ptr();
        }
    }

    /// Runs the marker over the vacated root set, republishing whatever
    /// it didn't finish (only non-empty after a cooperative abort).
    unsafe fn run_marker<T: Tracer>(&self, tracer: &T) {
        let roots = self.root_set.vacate();
        let mut marker = Marker::new(roots);
        let endpoint_color = self.alloc_color();
        let completed = marker.mark(tracer, endpoint_color, &self.running);
        if completed {
            // Every node this pass carved for derived pointers was fully
            // consumed; safe to release the scratch pool's chunks now.
            marker.release_pool();
        } else {
            // Aborted only happens alongside a collector-wide stop(); the
            // unprocessed remainder (which may include this pass's own
            // scratch nodes) is republished rather than walked further,
            // so the scratch pool's chunks are deliberately leaked here
            // rather than freed out from under a node some future pass
            // might still read.
            let remaining = marker.into_remaining();
            if !remaining.is_null() {
                let mut tail = remaining;
                let mut len = 1usize;
                while !(*tail).next_ptr().is_null() {
                    tail = (*tail).next_ptr();
                    len += 1;
                }
                self.root_set.vacate_and_append(remaining, tail, len);
            }
        }
    }

    unsafe fn run_sweeper<P: Policy>(&self, policy: &P) {
        let free_color = self.alloc_color().flip();
        for i in 0..SMALL_SIZE_CLASSES {
            let cell_size = 1usize << (SMALL_SIZE_CLASS_BASE_SHIFT + i as u32);
            sweep_small_class(
                cell_size,
                &self.small_used[i],
                &self.small_free[i],
                free_color,
                policy,
                &self.running,
            );
        }
        sweep_large_class(&self.large_used, &self.large_free, free_color, policy, &self.running);
    }

    /// Attempts one step of progress: advances the phase if every mutator
    /// has acknowledged it and dispatches whatever that transition
    /// requires. Returns the phase landed on, or `None` if nothing was
    /// ready to advance. Factored out of `run`'s loop so a single-threaded
    /// driver (tests) can step the collector deterministically without
    /// the idle-wait's timing.
    ///
    /// # Safety
    /// Same as `run`.
    pub(crate) unsafe fn step<T: Tracer, P: Policy>(&self, tracer: &T, policy: &P) -> Option<Phase> {
        let new_phase = self.try_advance()?;
        match new_phase {
            Phase::Tracing => self.run_marker(tracer),
            Phase::Sweep => self.run_sweeper(policy),
            Phase::First => {
                self.clear_buffers(tracer);
                self.cycles.fetch_add(1, Ordering::AcqRel);
            }
            _ => {}
        }
        Some(new_phase)
    }

    /// The collector's main loop: advances the phase whenever every
    /// mutator has acknowledged it, dispatching the marker on entry to
    /// `Tracing`, the sweeper on entry to `Sweep`, and buffer clearing
    /// whenever the cycle wraps back to `First`. Idles on a condition
    /// variable (instead of spinning) while waiting for stragglers.
    ///
    /// # Safety
    /// `tracer`/`policy` must describe the same object layout every
    /// registered mutator allocates under.
    pub unsafe fn run<T: Tracer, P: Policy>(&self, tracer: &T, policy: &P) {
        while self.is_running() {
            match self.step(tracer, policy) {
                Some(_) => {}
                None => {
                    let mut guard = self.idle.lock();
                    if !self.is_running() || self.phase.all_shaken() {
                        continue;
                    }
                    self.idle_cv.wait_for(&mut guard, Duration::from_millis(1));
                }
            }
        }
    }

    /// Publishes the collector's own node pools into `allocation_dump`
    /// before shutdown so `destroy` frees them along with everything
    /// mutators left behind. The collector itself carves no nodes today
    /// (all node pools are per-mutator), so this is currently a no-op
    /// kept as the documented hook 9. describes for symmetry with
    /// mutator shutdown.
    pub fn drain_pools(&self) {}

    /// After every mutator has detached (`active == 0`) and `run` has
    /// returned, finalizes every remaining live cell and releases all
    /// raw chunks recorded in `allocation_dump`.
    ///
    /// # Safety
    /// Must only be called once no mutator remains registered.
    pub unsafe fn destroy<P: Policy>(&self, policy: &P) {
        debug_assert_eq!(self.phase.active(), 0);

        for i in 0..SMALL_SIZE_CLASSES {
            let cell_size = 1usize << (SMALL_SIZE_CLASS_BASE_SHIFT + i as u32);
            let mut used = self.small_used[i].vacate();
            loop {
                let st = used.pop_front();
                if st.is_null() {
                    break;
                }
                let mut offset = (*st).start;
                let extent = offset + (*st).size * cell_size;
                while offset < extent {
                    let cell = offset as *mut u8;
                    let payload = cell.add(16);
                    let header = header_of(payload);
                    policy.destroy(header, payload);
                    *(cell as *mut u64) = 0;
                    offset += cell_size;
                }
                drop(Box::from_raw(st));
            }
        }

        let mut used = self.large_used.vacate();
        loop {
            let blk = used.pop_front();
            if blk.is_null() {
                break;
            }
            let b = LargeBlock::from_raw(blk);
            policy.destroy(b.header(), b.payload());
        }

        self.allocation_dump.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use std::ptr::null_mut;

    struct NoPtrTracer;
    impl Tracer for NoPtrTracer {
        unsafe fn num_log_ptrs(&self, _header: &Header) -> usize {
            0
        }
        unsafe fn log_ptr(&self, _header: &Header, _obj_ptr: *mut u8, _seg: usize) -> *mut u8 {
            null_mut()
        }
        unsafe fn copy_obj(&self, _header: &Header, _obj_ptr: *mut u8) -> *mut u8 {
            null_mut()
        }
        unsafe fn copy_obj_segment(&self, _header: &Header, _obj_ptr: *mut u8, _seg: usize) -> *mut u8 {
            null_mut()
        }
        unsafe fn get_derived_ptrs(&self, _header: &Header, _snapshot: *mut u8) -> Vec<*mut u8> {
            vec![]
        }
        unsafe fn derived_ptrs_of_obj_segment(
            &self,
            _header: &Header,
            _snapshot: *mut u8,
            _seg: usize,
        ) -> Vec<*mut u8> {
            vec![]
        }
    }

    struct NoopPolicy;
    impl Policy for NoopPolicy {
        unsafe fn destroy(&self, _header: &Header, _header_ptr: *mut u8) {}
    }

    #[test]
    fn try_advance_requires_all_mutators_shaken() {
        let gc = Gc::new();
        let p = gc.phase.register();
        assert_eq!(p, Phase::First);
        // Freshly registered mutator is already counted as shaken, so the
        // very first try_advance should succeed immediately.
        assert_eq!(gc.try_advance(), Some(Phase::Second));
    }

    #[test]
    fn alloc_color_flips_on_leaving_second() {
        let gc = Gc::new();
        gc.phase.register();
        let before = gc.alloc_color();
        assert_eq!(gc.try_advance(), Some(Phase::Second));
        assert_eq!(gc.alloc_color(), before);
        assert_eq!(gc.try_advance(), Some(Phase::Third));
        assert_eq!(gc.alloc_color(), before.flip());
    }

    #[test]
    fn run_to_stop_terminates_with_no_registered_mutators() {
        let gc = Gc::new();
        gc.stop();
        let tracer = NoPtrTracer;
        let policy = NoopPolicy;
        unsafe { gc.run(&tracer, &policy) };
        unsafe { gc.destroy(&policy) };
    }
}
