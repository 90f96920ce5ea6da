//! The large-block buddy allocator's storage layout and linked lists.
//!
//! A large block is a raw `aligned_alloc`ed buffer treated as a cursor
//! over manually laid-out fields rather than a Rust struct, with its
//! first 40 bytes reserved as metadata:
//!
//! ```text
//! [ size(8) | split(8) | prev(8) | next(8) | num_lp(8) | log_ptrs... | header(8) | payload ]
//! ```
//!
//! `size` holds the block's power-of-two size class `k` (block is
//! `2^k` bytes). `split` packs a 32-bit split count and a 32-bit bit
//! trail recording the left/right choice at each buddy split, letting a
//! block locate its buddy by address arithmetic alone. `prev`/`next`
//! thread the block through whichever doubly linked list currently owns
//! it.

use crossbeam_utils::atomic::AtomicCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::LARGE_BLOCK_METADATA_SIZE;
use crate::header::Header;

const SIZE_OFF: usize = 0;
const SPLIT_OFF: usize = 8;
const PREV_OFF: usize = 16;
const NEXT_OFF: usize = 24;
const NUM_LP_OFF: usize = 32;
const LOG_PTRS_OFF: usize = LARGE_BLOCK_METADATA_SIZE;

/// A cursor over one large block's raw storage. Copy because it's just a
/// typed view of a pointer; no ownership is implied.
#[derive(Copy, Clone)]
pub struct LargeBlock(*mut u8);

impl LargeBlock {
    #[inline]
    pub fn from_raw(ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null());
        LargeBlock(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    #[inline]
    fn field(self, off: usize) -> *mut u64 {
        unsafe { self.0.add(off) as *mut u64 }
    }

    pub fn class(self) -> u32 {
        unsafe { *self.field(SIZE_OFF) as u32 }
    }

    pub unsafe fn set_class(self, k: u32) {
        *self.field(SIZE_OFF) = k as u64;
    }

    pub fn byte_size(self) -> usize {
        1usize << self.class()
    }

    /// `(split_count, trail)`.
    pub fn split(self) -> (u32, u32) {
        let word = unsafe { *self.field(SPLIT_OFF) };
        ((word & 0xffff_ffff) as u32, (word >> 32) as u32)
    }

    pub unsafe fn set_split(self, split_count: u32, trail: u32) {
        let word = (split_count as u64) | ((trail as u64) << 32);
        *self.field(SPLIT_OFF) = word;
    }

    pub fn prev(self) -> *mut u8 {
        unsafe { *self.field(PREV_OFF) as *mut u8 }
    }

    pub unsafe fn set_prev(self, p: *mut u8) {
        *self.field(PREV_OFF) = p as u64;
    }

    pub fn next(self) -> *mut u8 {
        unsafe { *self.field(NEXT_OFF) as *mut u8 }
    }

    pub unsafe fn set_next(self, p: *mut u8) {
        *self.field(NEXT_OFF) = p as u64;
    }

    pub fn num_log_ptrs(self) -> u64 {
        unsafe { *self.field(NUM_LP_OFF) }
    }

    pub unsafe fn set_num_log_ptrs(self, n: u64) {
        *self.field(NUM_LP_OFF) = n;
    }

    pub fn log_ptr_slot(self, seg: usize) -> &'static AtomicU64 {
        debug_assert!((seg as u64) < self.num_log_ptrs());
        unsafe { &*(self.0.add(LOG_PTRS_OFF + seg * 8) as *const AtomicU64) }
    }

    fn header_offset(self) -> usize {
        LOG_PTRS_OFF + (self.num_log_ptrs() as usize) * 8
    }

    pub fn header(self) -> &'static Header {
        unsafe { &*(self.0.add(self.header_offset()) as *const Header) }
    }

    pub fn payload(self) -> *mut u8 {
        unsafe { self.0.add(self.header_offset() + 8) }
    }

    /// Total bytes of metadata (fixed prefix + log-pointer table + header)
    /// preceding the payload.
    pub fn metadata_size(self) -> usize {
        self.header_offset() + 8
    }

    /// Computes this block's buddy address at the current split depth,
    /// per the `split` trail's lowest unconsumed bit: buddies differ by
    /// exactly `byte_size()` at that level, on whichever side the trail
    /// records.
    pub fn buddy_addr(self) -> *mut u8 {
        let (count, trail) = self.split();
        debug_assert!(count > 0, "class-0 split block has no buddy");
        let size = self.byte_size();
        let bit = trail & 1;
        if bit == 0 {
            unsafe { self.0.add(size) }
        } else {
            unsafe { self.0.sub(size) }
        }
    }
}

/// A plain, non-atomic doubly linked list of large blocks, threaded
/// through each block's own `prev`/`next` fields. This is the shape used
/// by a mutator's private free/used lists (4.E: "owns a private
/// `large_block_list` free list and used list").
pub struct LargeBlockList {
    head: *mut u8,
    tail: *mut u8,
    len: usize,
}

impl LargeBlockList {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn head(&self) -> *mut u8 {
        self.head
    }

    pub unsafe fn push_front(&mut self, blk: *mut u8) {
        let b = LargeBlock::from_raw(blk);
        b.set_prev(null_mut());
        b.set_next(self.head);
        if !self.head.is_null() {
            LargeBlock::from_raw(self.head).set_prev(blk);
        }
        self.head = blk;
        if self.tail.is_null() {
            self.tail = blk;
        }
        self.len += 1;
    }

    pub unsafe fn pop_front(&mut self) -> *mut u8 {
        if self.head.is_null() {
            return null_mut();
        }
        let blk = self.head;
        let b = LargeBlock::from_raw(blk);
        self.head = b.next();
        if self.head.is_null() {
            self.tail = null_mut();
        } else {
            LargeBlock::from_raw(self.head).set_prev(null_mut());
        }
        self.len -= 1;
        blk
    }

    /// Removes `blk` from wherever it sits in the list.
    pub unsafe fn unlink(&mut self, blk: *mut u8) {
        let b = LargeBlock::from_raw(blk);
        let prev = b.prev();
        let next = b.next();
        if !prev.is_null() {
            LargeBlock::from_raw(prev).set_next(next);
        } else {
            self.head = next;
        }
        if !next.is_null() {
            LargeBlock::from_raw(next).set_prev(prev);
        } else {
            self.tail = prev;
        }
        b.set_prev(null_mut());
        b.set_next(null_mut());
        self.len -= 1;
    }

    /// Linear scan for a block at `addr` of the given class, used by
    /// buddy coalescing to test "is my buddy free and unsplit".
    pub fn find(&self, addr: *mut u8) -> Option<*mut u8> {
        let mut cur = self.head;
        while !cur.is_null() {
            if cur == addr {
                return Some(cur);
            }
            cur = LargeBlock::from_raw(cur).next();
        }
        None
    }

    pub unsafe fn append(&mut self, other: &mut LargeBlockList) {
        if other.head.is_null() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
            self.tail = other.tail;
        } else {
            LargeBlock::from_raw(self.tail).set_next(other.head);
            LargeBlock::from_raw(other.head).set_prev(self.tail);
            self.tail = other.tail;
        }
        self.len += other.len;
        other.head = null_mut();
        other.tail = null_mut();
        other.len = 0;
    }
}

impl Default for LargeBlockList {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector's shared, lock-free counterpart: `large_used_list` /
/// `large_free_list`. Same embedded-link storage, but the head is an
/// `AtomicCell` and publication goes through vacate-and-append so
/// multiple mutators can hand off concurrently.
pub struct SharedLargeBlockList {
    head: AtomicCell<*mut u8>,
}

unsafe impl Send for SharedLargeBlockList {}
unsafe impl Sync for SharedLargeBlockList {}

impl SharedLargeBlockList {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_null()
    }

    pub unsafe fn push_front(&self, blk: *mut u8) {
        let b = LargeBlock::from_raw(blk);
        let mut cur = self.head.load();
        loop {
            b.set_next(cur);
            match self.head.compare_exchange(cur, blk) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Detaches the whole shared chain, returning it as a private list
    /// whose prev pointers are already correctly threaded (the shared
    /// list never uses them, but downstream private-list ops rely on
    /// them, so we repair them on the way out).
    pub unsafe fn vacate(&self) -> LargeBlockList {
        let head = self.head.swap(null_mut());
        let mut list = LargeBlockList::new();
        let mut cur = head;
        let mut prev = null_mut();
        let mut len = 0;
        while !cur.is_null() {
            let b = LargeBlock::from_raw(cur);
            b.set_prev(prev);
            prev = cur;
            cur = b.next();
            len += 1;
        }
        list.head = head;
        list.tail = prev;
        list.len = len;
        list
    }

    /// Splices a private list onto the shared list's front in one CAS,
    /// per the vacate-and-append primitive shared with `AtomicList`.
    pub unsafe fn vacate_and_append(&self, mut private: LargeBlockList) {
        if private.is_empty() {
            return;
        }
        let head = private.head;
        let tail = private.tail;
        let mut cur = self.head.load();
        loop {
            LargeBlock::from_raw(tail).set_next(cur);
            if !cur.is_null() {
                LargeBlock::from_raw(cur).set_prev(tail);
            }
            match self.head.compare_exchange(cur, head) {
                Ok(_) => {
                    private.head = null_mut();
                    private.tail = null_mut();
                    private.len = 0;
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for SharedLargeBlockList {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a free block of class `k` down to class `s`, returning the
/// `s`-class block and pushing every peeled-off buddy (classes
/// `k-1 .. s`) onto `free` at their own class, per 4.B. Each peeled
/// buddy's `split` field records how many levels it sits below the
/// original block and the trail of left/right choices taken so far.
pub unsafe fn split_down(blk: *mut u8, from_class: u32, to_class: u32, free: &mut LargeBlockList) {
    debug_assert!(to_class <= from_class);
    let (base_count, base_trail) = LargeBlock::from_raw(blk).split();
    let mut depth = base_count;
    let mut trail = base_trail;
    for class in (to_class..from_class).rev() {
        let half = LargeBlock::from_raw(blk);
        let buddy_ptr = blk.add(1usize << class);
        let buddy = LargeBlock::from_raw(buddy_ptr);
        half.set_class(class);
        depth += 1;
        // `blk` keeps the "left" (bit 0) branch; its buddy takes "right"
        // (bit 1).
        buddy.set_class(class);
        buddy.set_split(depth, trail | 1);
        half.set_split(depth, trail);
        free.push_front(buddy_ptr);
        trail <<= 1;
    }
    LargeBlock::from_raw(blk).set_class(to_class);
}

/// Attempts to coalesce a just-freed block with its buddy, repeatedly,
/// as long as the buddy is present (free, unsplit at this level) in
/// `free`. Returns the final merged block and its class.
pub unsafe fn coalesce(blk: *mut u8, free: &mut LargeBlockList) -> (*mut u8, u32) {
    let mut cur = blk;
    loop {
        let b = LargeBlock::from_raw(cur);
        let (count, _trail) = b.split();
        if count == 0 {
            return (cur, b.class());
        }
        let buddy_addr = b.buddy_addr();
        match free.find(buddy_addr) {
            Some(buddy_ptr) => {
                let buddy = LargeBlock::from_raw(buddy_ptr);
                if buddy.class() != b.class() {
                    return (cur, b.class());
                }
                free.unlink(buddy_ptr);
                let merged = cur.min(buddy_ptr);
                let (count, trail) = b.split();
                let merged_block = LargeBlock::from_raw(merged);
                merged_block.set_class(b.class() + 1);
                merged_block.set_split(count - 1, trail >> 1);
                cur = merged;
            }
            None => return (cur, b.class()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    fn make_block(k: u32) -> *mut u8 {
        let size = 1usize << k;
        let layout = Layout::from_size_align(size, 16).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let b = LargeBlock::from_raw(ptr);
        unsafe {
            b.set_class(k);
            b.set_split(0, 0);
            b.set_prev(null_mut());
            b.set_next(null_mut());
            b.set_num_log_ptrs(1);
        }
        b.header().set_color(Color::Black, Ordering::Release);
        ptr
    }

    unsafe fn free_block(ptr: *mut u8, k: u32) {
        let layout = Layout::from_size_align(1usize << k, 16).unwrap();
        dealloc(ptr, layout);
    }

    #[test]
    fn split_then_coalesce_round_trips_to_original_class() {
        unsafe {
            let blk = make_block(12);
            let mut free_list = LargeBlockList::new();
            split_down(blk, 12, 10, &mut free_list);
            assert_eq!(free_list.len(), 2);
            assert_eq!(LargeBlock::from_raw(blk).class(), 10);

            // Pull the two siblings back out and attempt to merge them
            // all back with `blk`.
            let mut all_free = LargeBlockList::new();
            while !free_list.is_empty() {
                let node = free_list.pop_front();
                all_free.push_front(node);
            }
            let (merged, class) = coalesce(blk, &mut all_free);
            let (merged2, class2) = coalesce(merged, &mut all_free);
            assert_eq!(class2, 12);
            assert_eq!(merged2, blk.min(merged));
            let _ = class;

            // Cleanup: free every surviving chunk (merged2 covers all).
            free_block(merged2, 12);
        }
    }

    #[test]
    fn shared_list_push_and_vacate_preserves_count() {
        unsafe {
            let shared = SharedLargeBlockList::new();
            let a = make_block(10);
            let b = make_block(10);
            shared.push_front(a);
            shared.push_front(b);
            let vacated = shared.vacate();
            assert_eq!(vacated.len(), 2);
            assert!(shared.is_empty());
            free_block(a, 10);
            free_block(b, 10);
        }
    }
}
