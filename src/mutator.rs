//! The registered mutator (4.G): per-thread allocation state, write
//! barrier entry points, and the handshake poll every host safepoint
//! calls into. Registration happens on construction; `Drop` performs
//! the full detachment sequence (draining every private list into the
//! shared inventories).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::barrier::{self, BarrierState, BufferNode};
use crate::color::Color;
use crate::config::{
    LARGE_BLOCK_METADATA_SIZE, LARGE_OBJ_THRESHOLD, SEGMENT_SIZE, SMALL_BLOCK_METADATA_SIZE,
    SMALL_SIZE_CLASSES, SMALL_SIZE_CLASS_BASE_SHIFT, WORD_SIZE,
};
use crate::fixed_alloc::FixedAllocators;
use crate::gc::Gc;
use crate::header::{header_of, init_header};
use crate::internal::atomic_list::PrivateList;
use crate::internal::large_block::LargeBlock;
use crate::internal::trace::Tracer;
use crate::phase::Phase;
use crate::util::binary_log;
use crate::variable_alloc::VariableSizeManager;

/// A registered mutator. Construction registers it with `gc`;
/// `Drop` performs the full 4.G detachment sequence.
pub struct Mutator {
    gc: Arc<Gc>,
    fixed: FixedAllocators,
    variable: VariableSizeManager,
    barrier: BarrierState,
    root_callback: Option<Box<dyn Fn() -> Vec<*mut u8> + Send>>,
    current_phase: Phase,
    alloc_color: Color,
}

impl Mutator {
    pub fn new(gc: Arc<Gc>) -> Self {
        let current_phase = gc.phase.register();
        let alloc_color = gc.alloc_color();
        Self {
            gc,
            fixed: FixedAllocators::new(),
            variable: VariableSizeManager::new(),
            barrier: BarrierState::new(),
            root_callback: None,
            current_phase,
            alloc_color,
        }
    }

    /// Registers the callback invoked exactly once per cycle, the first
    /// time this mutator observes phase `Third` — it must return every
    /// user root pointer currently reachable from the host.
    pub fn set_root_callback(&mut self, f: impl Fn() -> Vec<*mut u8> + Send + 'static) {
        self.root_callback = Some(Box::new(f));
    }

    pub fn alloc_color(&self) -> Color {
        self.alloc_color
    }

    pub fn phase(&self) -> Phase {
        self.current_phase
    }

    /// Allocates `raw_size` bytes of payload tagged `tag`, with
    /// `descriptor` packed into the header for `Tracer` to decode, and
    /// `num_log_ptrs` per-segment log slots if the large path is taken
    /// (ignored on the small path, which always carries exactly one).
    /// Returns a pointer to the payload with header and log pointer(s)
    /// already initialized.
    pub fn allocate(&mut self, raw_size: usize, descriptor: u64, num_log_ptrs: usize, tag: u8) -> *mut u8 {
        if raw_size + SMALL_BLOCK_METADATA_SIZE <= LARGE_OBJ_THRESHOLD {
            self.allocate_small(raw_size, descriptor, tag)
        } else {
            self.allocate_large(raw_size, descriptor, tag, num_log_ptrs)
        }
    }

    fn allocate_small(&mut self, raw_size: usize, descriptor: u64, tag: u8) -> *mut u8 {
        let needed = raw_size + SMALL_BLOCK_METADATA_SIZE;
        let min_shift = SMALL_SIZE_CLASS_BASE_SHIFT;
        let max_shift = SMALL_SIZE_CLASS_BASE_SHIFT + SMALL_SIZE_CLASSES as u32 - 1;
        let k = binary_log(needed).clamp(min_shift, max_shift);
        let class = FixedAllocators::class_index_for_shift(k);
        let cell = self.fixed.manager(class).allocate(&self.gc.small_free[class]);
        unsafe {
            *(cell as *mut u64) = 0; // log pointer slot, none recorded yet
            init_header(cell.add(WORD_SIZE), self.alloc_color, tag, descriptor);
            cell.add(SMALL_BLOCK_METADATA_SIZE)
        }
    }

    fn allocate_large(&mut self, raw_size: usize, descriptor: u64, tag: u8, num_log_ptrs: usize) -> *mut u8 {
        let needed = raw_size + LARGE_BLOCK_METADATA_SIZE + num_log_ptrs * WORD_SIZE;
        let k = binary_log(needed).max(9);
        let blk = self.variable.allocate(k, &self.gc.large_free);
        let b = LargeBlock::from_raw(blk);
        unsafe {
            b.set_num_log_ptrs(num_log_ptrs as u64);
            for seg in 0..num_log_ptrs {
                b.log_ptr_slot(seg).store(0, Ordering::Relaxed);
            }
            let header_ptr = b.header() as *const _ as *mut u8;
            init_header(header_ptr, self.alloc_color, tag, descriptor);
            b.payload()
        }
    }

    /// Wraps a store of `new_value` into the pointer-sized slot `field`,
    /// which sits at byte `offset` inside `parent`'s payload. Implements
    /// 4.H's four steps in order: prelude (pre-image capture), the
    /// store itself, then snooping capture of the new value if active.
    ///
    /// # Safety
    /// `parent` must be a live payload pointer this mutator (or another
    /// registered mutator under the same `Gc`) allocated, laid out per
    /// `tracer`'s description; `field` must be the actual slot being
    /// overwritten.
    pub unsafe fn write_barrier<T: Tracer>(
        &mut self,
        tracer: &T,
        parent: *mut u8,
        field: &AtomicUsize,
        offset: usize,
        new_value: *mut u8,
    ) {
        barrier::write_barrier_prelude(
            tracer,
            self.current_phase,
            self.alloc_color,
            parent,
            offset,
            SEGMENT_SIZE,
            &mut self.barrier.pool,
            &mut self.barrier.buffer,
        );
        field.store(new_value as usize, Ordering::Release);
        barrier::snoop_store(
            self.current_phase,
            new_value,
            &mut self.barrier.pool,
            &mut self.barrier.snooped,
        );
    }

    /// The CAS-shaped sibling of [`write_barrier`](Self::write_barrier):
    /// runs the prelude before attempting the exchange, same as the
    /// plain store, but only treats `new_value` as snooped when the CAS
    /// actually lands — a failed CAS never wrote `new_value` into the
    /// slot, so it's not a reference the mutator loaded.
    ///
    /// # Safety
    /// Same preconditions as `write_barrier`.
    pub unsafe fn write_barrier_cas<T: Tracer>(
        &mut self,
        tracer: &T,
        parent: *mut u8,
        field: &AtomicUsize,
        offset: usize,
        current: *mut u8,
        new_value: *mut u8,
    ) -> Result<*mut u8, *mut u8> {
        barrier::write_barrier_prelude(
            tracer,
            self.current_phase,
            self.alloc_color,
            parent,
            offset,
            SEGMENT_SIZE,
            &mut self.barrier.pool,
            &mut self.barrier.buffer,
        );
        let result = field.compare_exchange(
            current as usize,
            new_value as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if result.is_ok() {
            barrier::snoop_store(
                self.current_phase,
                new_value,
                &mut self.barrier.pool,
                &mut self.barrier.snooped,
            );
        }
        result.map(|v| v as *mut u8).map_err(|v| v as *mut u8)
    }

    /// Called by the host at GC-safe points. No-op unless the published
    /// phase has moved since this mutator last observed it.
    ///
    /// # Safety
    /// Every cell this mutator has allocated must be laid out per
    /// `tracer`'s description (only consulted indirectly, through the
    /// invariant that the shared inventories this publishes into are
    /// read by a marker/sweeper using the same `tracer`/`policy`).
    pub unsafe fn poll_for_sync<T: Tracer>(&mut self, tracer: &T) {
        let _ = tracer; // reserved: a future root_callback variant may need it
        let observed = self.gc.phase.phase();
        if observed == self.current_phase {
            return;
        }

        match observed {
            Phase::Third => {
                let mut roots = PrivateList::new();
                if let Some(cb) = &self.root_callback {
                    for p in cb() {
                        roots.push_front(BufferNode::new(&mut self.barrier.pool, p, false));
                    }
                }
                while !self.barrier.snooped.is_empty() {
                    let node = self.barrier.snooped.pop_front();
                    roots.push_front(node);
                }
                roots.publish_to(&self.gc.root_set);

                for (i, mgr) in self.fixed.iter_mut().enumerate() {
                    self.gc.small_used[i].vacate_and_append(mgr.take_used());
                }
                self.gc.large_used.vacate_and_append(self.variable.take_used());

                self.alloc_color = self.gc.alloc_color();
            }
            Phase::Fourth => {
                self.barrier.buffer.publish_to(&self.gc.buffer_set);
            }
            _ => {}
        }

        self.current_phase = observed;
        self.gc.phase.acknowledge();
        if self.gc.phase.all_shaken() {
            self.gc.notify_shaken();
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.gc.phase.deregister(self.current_phase);

        for (i, mgr) in self.fixed.iter_mut().enumerate() {
            unsafe {
                self.gc.small_used[i].vacate_and_append(mgr.take_used());
                self.gc.small_free[i].vacate_and_append(mgr.take_free());
            }
            for chunk in mgr.drain_chunks() {
                unsafe { self.gc.allocation_dump.publish(chunk) };
            }
        }

        unsafe {
            self.gc.large_used.vacate_and_append(self.variable.take_used());
            self.gc.large_free.vacate_and_append(self.variable.take_free());
        }
        for (ptr, _class) in self.variable.drain_raw_blocks() {
            unsafe { self.gc.allocation_dump.publish(ptr) };
        }

        unsafe { self.barrier.buffer.publish_to(&self.gc.buffer_set) };
        for chunk in self.barrier.pool.drain_chunks() {
            unsafe { self.gc.allocation_dump.publish(chunk) };
        }

        self.gc.notify_shaken();
    }
}
