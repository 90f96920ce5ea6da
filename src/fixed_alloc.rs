//! Fixed-size manager: one per small-object size class `k ∈ 3..9`. Bump
//! carves cells out of acquired stubs, growing its backing storage by
//! doubling raw chunks up to a plateau.

use crate::config::{SMALL_BLOCK_SIZE_LIMIT, SMALL_SIZE_CLASSES, SMALL_SIZE_CLASS_BASE_SHIFT};
use crate::internal::stub_list::{SharedStubList, Stub, StubList};

/// The bump cursor over the stub currently being carved.
struct ActiveStub {
    cursor: usize,
    end: usize,
}

pub struct FixedSizeManager {
    /// `k`: cells are `2^k` bytes.
    class_shift: u32,
    active: Option<ActiveStub>,
    free: StubList,
    used: StubList,
    /// Number of raw-chunk growths performed so far, capped at
    /// `SMALL_BLOCK_SIZE_LIMIT`; drives the doubling-then-plateau policy.
    growths: u32,
    raw_chunks: Vec<*mut u8>,
}

impl FixedSizeManager {
    pub fn new(class_shift: u32) -> Self {
        Self {
            class_shift,
            active: None,
            free: StubList::new(),
            used: StubList::new(),
            growths: 0,
            raw_chunks: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> usize {
        1usize << self.class_shift
    }

    fn next_chunk_bytes(&self) -> usize {
        let base = 8usize << self.class_shift;
        let doublings = self.growths.min(SMALL_BLOCK_SIZE_LIMIT);
        base << doublings
    }

    fn grow_with_raw_chunk(&mut self) {
        let bytes = self.next_chunk_bytes();
        let align = self.cell_size().min(16).max(8);
        let ptr = unsafe { libc::aligned_alloc(align, bytes) } as *mut u8;
        assert!(!ptr.is_null(), "fixed-size manager chunk allocation failed");
        self.raw_chunks.push(ptr);
        if self.growths < SMALL_BLOCK_SIZE_LIMIT {
            self.growths += 1;
        }
        let ncells = bytes / self.cell_size();
        let stub = Stub::new(ptr as usize, ncells);
        unsafe { self.free.push_front(stub) };
    }

    /// Pulls a stub from `shared_free` if the local free list is empty.
    fn refill_from_shared(&mut self, shared_free: &SharedStubList) -> bool {
        let mut vacated = unsafe { shared_free.vacate() };
        if vacated.is_empty() {
            return false;
        }
        unsafe { self.free.append(&mut vacated) };
        true
    }

    fn activate_next_stub(&mut self) -> bool {
        let stub = unsafe { self.free.pop_front() };
        if stub.is_null() {
            return false;
        }
        let (start, size) = unsafe { ((*stub).start, (*stub).size) };
        self.active = Some(ActiveStub {
            cursor: start,
            end: start + size * self.cell_size(),
        });
        unsafe { drop(Box::from_raw(stub)) };
        true
    }

    /// Carves one cell, growing backing storage as needed. `shared_free`
    /// is consulted before falling back to a fresh raw chunk.
    pub fn allocate(&mut self, shared_free: &SharedStubList) -> *mut u8 {
        loop {
            if let Some(active) = &mut self.active {
                if active.cursor < active.end {
                    let cell = active.cursor as *mut u8;
                    active.cursor += self.cell_size();
                    let singleton = Stub::new(cell as usize, 1);
                    unsafe { self.used.push_front(singleton) };
                    return cell;
                }
            }
            if self.activate_next_stub() {
                continue;
            }
            if self.refill_from_shared(shared_free) {
                continue;
            }
            self.grow_with_raw_chunk();
        }
    }

    /// Hands the private used list to the caller for publication into
    /// the shared used list at the `Third` handshake.
    pub fn take_used(&mut self) -> StubList {
        std::mem::replace(&mut self.used, StubList::new())
    }

    /// Hands the private free list to the caller for publication at
    /// detachment.
    pub fn take_free(&mut self) -> StubList {
        std::mem::replace(&mut self.free, StubList::new())
    }

    /// Drains every raw chunk this manager has ever allocated, for
    /// publication to the shared allocation dump at mutator detach.
    pub fn drain_chunks(&mut self) -> Vec<*mut u8> {
        std::mem::take(&mut self.raw_chunks)
    }
}

/// One `FixedSizeManager` per class, indexed `0..SMALL_SIZE_CLASSES`
/// (class `i` has `k = SMALL_SIZE_CLASS_BASE_SHIFT + i`).
pub struct FixedAllocators {
    managers: Vec<FixedSizeManager>,
}

impl FixedAllocators {
    pub fn new() -> Self {
        let managers = (0..SMALL_SIZE_CLASSES)
            .map(|i| FixedSizeManager::new(SMALL_SIZE_CLASS_BASE_SHIFT + i as u32))
            .collect();
        Self { managers }
    }

    pub fn class_index_for_shift(shift: u32) -> usize {
        (shift - SMALL_SIZE_CLASS_BASE_SHIFT) as usize
    }

    pub fn manager(&mut self, class: usize) -> &mut FixedSizeManager {
        &mut self.managers[class]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FixedSizeManager> {
        self.managers.iter_mut()
    }
}

impl Default for FixedAllocators {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FixedSizeManager {
    fn drop(&mut self) {
        // Raw chunks outlive the manager via the allocation dump in the
        // normal shutdown path; `drain_chunks` empties `raw_chunks`
        // before detachment publishes them. Anything still here was
        // never published (e.g. a manager dropped without detaching)
        // and must still be released to avoid leaking system memory.
        for chunk in self.raw_chunks.drain(..) {
            unsafe { libc::free(chunk as *mut libc::c_void) };
        }
    }
}
