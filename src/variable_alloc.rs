//! Variable-size manager (4.E): services allocations above
//! `large_obj_threshold` from a private buddy free list, falling back to
//! the shared free list and finally to a fresh system allocation.
//! Mirrors `include/variable_list_manager.hpp`, with the buddy
//! split/coalesce mechanics supplied by `internal::large_block`.

use std::ptr::null_mut;

use crate::config::SEARCH_DEPTH;
use crate::internal::large_block::{split_down, LargeBlock, LargeBlockList, SharedLargeBlockList};

pub struct VariableSizeManager {
    free: LargeBlockList,
    used: LargeBlockList,
    raw_blocks: Vec<(*mut u8, u32)>,
}

impl VariableSizeManager {
    pub fn new() -> Self {
        Self {
            free: LargeBlockList::new(),
            used: LargeBlockList::new(),
            raw_blocks: Vec::new(),
        }
    }

    /// Bounded best-fit: scans at most `SEARCH_DEPTH` free blocks,
    /// returning the first one whose class is `>= want`. Splits it down
    /// to `want` if it was larger.
    fn get_block(&mut self, want: u32) -> Option<*mut u8> {
        let mut cur = self.free.head();
        let mut depth = 0;
        while !cur.is_null() && depth < SEARCH_DEPTH {
            let b = LargeBlock::from_raw(cur);
            if b.class() >= want {
                unsafe { self.free.unlink(cur) };
                if b.class() > want {
                    unsafe { split_down(cur, b.class(), want, &mut self.free) };
                }
                return Some(cur);
            }
            cur = b.next();
            depth += 1;
        }
        None
    }

    fn alloc_raw_block(&mut self, class: u32) -> *mut u8 {
        let bytes = 1usize << class;
        let ptr = unsafe { libc::aligned_alloc(16, bytes) } as *mut u8;
        assert!(!ptr.is_null(), "variable-size manager block allocation failed");
        let b = LargeBlock::from_raw(ptr);
        unsafe {
            b.set_class(class);
            b.set_split(0, 0);
            b.set_prev(null_mut());
            b.set_next(null_mut());
        }
        self.raw_blocks.push((ptr, class));
        ptr
    }

    /// Allocates a block of class `k`, consulting the private free list,
    /// then `shared_free` via vacate-and-append, then the system
    /// allocator. Enrolls the result in the used list.
    pub fn allocate(&mut self, k: u32, shared_free: &SharedLargeBlockList) -> *mut u8 {
        let blk = match self.get_block(k) {
            Some(b) => b,
            None => {
                if !shared_free.is_empty() {
                    let vacated = unsafe { shared_free.vacate() };
                    let mut vacated = vacated;
                    unsafe { self.free.append(&mut vacated) };
                    self.get_block(k).unwrap_or_else(|| self.alloc_raw_block(k))
                } else {
                    self.alloc_raw_block(k)
                }
            }
        };
        unsafe { self.used.push_front(blk) };
        blk
    }

    pub fn take_used(&mut self) -> LargeBlockList {
        std::mem::replace(&mut self.used, LargeBlockList::new())
    }

    pub fn take_free(&mut self) -> LargeBlockList {
        std::mem::replace(&mut self.free, LargeBlockList::new())
    }

    pub fn drain_raw_blocks(&mut self) -> Vec<(*mut u8, u32)> {
        std::mem::take(&mut self.raw_blocks)
    }
}

impl Default for VariableSizeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_falls_back_to_raw_system_allocation() {
        let shared = SharedLargeBlockList::new();
        let mut mgr = VariableSizeManager::new();
        let blk = mgr.allocate(10, &shared);
        assert!(!blk.is_null());
        assert_eq!(LargeBlock::from_raw(blk).class(), 10);
        assert_eq!(mgr.used.len(), 1);
    }

    #[test]
    fn get_block_splits_a_larger_free_block() {
        let shared = SharedLargeBlockList::new();
        let mut mgr = VariableSizeManager::new();
        // Seed the free list with one class-12 block directly.
        let raw = unsafe { libc::aligned_alloc(16, 1 << 12) } as *mut u8;
        let b = LargeBlock::from_raw(raw);
        unsafe {
            b.set_class(12);
            b.set_split(0, 0);
            b.set_prev(null_mut());
            b.set_next(null_mut());
            mgr.free.push_front(raw);
        }
        let blk = mgr.allocate(10, &shared);
        assert_eq!(LargeBlock::from_raw(blk).class(), 10);
        assert_eq!(mgr.free.len(), 1); // the peeled-off class-11 buddy
    }
}
