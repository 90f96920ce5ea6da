//! The snapshot-at-the-beginning + incremental-update write barrier
//! (4.H). Wraps every user-visible pointer-slot write; records a
//! pre-image the first time a reachable object is mutated during a
//! cycle, tagging the parent pointer's low bit as an "end of this
//! object's segment block" sentinel so the marker and buffer-clearing
//! can walk the shared log buffer unambiguously. Mirrors
//! `include/write_barrier.hpp`.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::color::Color;
use crate::header::{header_of, Header};
use crate::internal::atomic_list::{AtomicList, ListLink, PrivateList};
use crate::internal::node_pool::NodePool;
use crate::internal::trace::Tracer;
use crate::phase::Phase;

/// One entry in a mutator's `buffer`/the shared `buffer_set`: either a
/// plain derived pointer, or — if its low bit is set — the tagged parent
/// pointer marking the start of the run it's followed by.
pub struct BufferNode {
    ptr: usize,
    next: *mut BufferNode,
}

impl BufferNode {
    /// Carves a node from `pool` rather than calling into the global
    /// allocator per entry (4.A: log buffer entries are the hottest
    /// allocation path under the write barrier). The node's backing
    /// chunk is released only when `pool`'s owner drains it — readers
    /// must never individually free a node returned from here.
    pub(crate) fn new(pool: &mut NodePool<BufferNode>, ptr: *mut u8, tagged: bool) -> *mut BufferNode {
        let mut v = ptr as usize;
        if tagged {
            v |= 1;
        }
        let node = pool.get();
        unsafe { std::ptr::write(node, BufferNode { ptr: v, next: null_mut() }) };
        node
    }

    pub fn is_sentinel(&self) -> bool {
        self.ptr & 1 == 1
    }

    /// The pointer this node carries, with the tag bit (if any) masked
    /// off.
    pub fn untagged_ptr(&self) -> *mut u8 {
        (self.ptr & !1usize) as *mut u8
    }
}

impl ListLink for BufferNode {
    fn next_ptr(&self) -> *mut BufferNode {
        self.next
    }
    fn set_next_ptr(&mut self, next: *mut BufferNode) {
        self.next = next;
    }
}

pub type SharedBufferSet = AtomicList<BufferNode>;

/// Per-mutator write-barrier state: the growing local log buffer and the
/// snooping-phase capture list, both published at handshake points, plus
/// the thread-local slab pool both are carved from.
pub struct BarrierState {
    pub buffer: PrivateList<BufferNode>,
    pub snooped: PrivateList<BufferNode>,
    pub pool: NodePool<BufferNode>,
}

impl BarrierState {
    pub fn new() -> Self {
        Self {
            buffer: PrivateList::new(),
            snooped: PrivateList::new(),
            pool: NodePool::new(),
        }
    }
}

impl Default for BarrierState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pushes `derived` (the segment's current outgoing pointers) onto the
/// buffer, followed by the tagged parent pointer as the terminating
/// sentinel, and returns the new buffer head to store into the log
/// pointer slot.
unsafe fn deposit_segment_log(
    pool: &mut NodePool<BufferNode>,
    buffer: &mut PrivateList<BufferNode>,
    parent: *mut u8,
    derived: &[*mut u8],
) -> *mut BufferNode {
    for &d in derived {
        buffer.push_front(BufferNode::new(pool, d, false));
    }
    let sentinel = BufferNode::new(pool, parent, true);
    buffer.push_front(sentinel);
    buffer.head()
}

/// Runs the write-barrier prelude for a store of offset `offset` inside
/// `parent`'s payload, before the store itself happens. No-op unless
/// tracing is active and `parent`'s header isn't already the current
/// alloc color.
///
/// # Safety
/// `parent` must be a live object payload pointer laid out per this
/// crate's header conventions; `tracer` must describe the same object
/// model `parent` was allocated under.
pub unsafe fn write_barrier_prelude<T: Tracer>(
    tracer: &T,
    phase: Phase,
    alloc_color: Color,
    parent: *mut u8,
    offset: usize,
    segment_size: usize,
    pool: &mut NodePool<BufferNode>,
    buffer: &mut PrivateList<BufferNode>,
) {
    if parent.is_null() || !phase.tracing() {
        return;
    }
    let header = header_of(parent);
    if header.color(Ordering::Acquire) == alloc_color {
        return;
    }
    let seg = offset / segment_size;
    let lp = tracer.log_ptr(header_as_ref(header), parent, seg) as *mut AtomicUsize;
    if (*lp).load(Ordering::Acquire) == 0 {
        let snapshot = tracer.copy_obj_segment(header_as_ref(header), parent, seg);
        // §7: a null snapshot is treated as "dirtied retry" — no derived
        // pointers are recorded now; the marker retries via its own
        // `copy_obj_segment` call when it later walks this still-null slot.
        let derived = if snapshot.is_null() {
            Vec::new()
        } else {
            tracer.derived_ptrs_of_obj_segment(header_as_ref(header), snapshot, seg)
        };
        if (*lp).load(Ordering::Acquire) == 0 {
            let head = deposit_segment_log(pool, buffer, parent, &derived);
            (*lp).store(head as usize, Ordering::Release);
        }
    }
}

/// Snooping-phase capture: when `phase.snooping()` and a non-null value
/// is written (or successfully CAS'd in), that reference itself is
/// pushed as a root candidate — snooping is "capture references loaded
/// by the mutator as roots," not "capture what the reference points to."
pub unsafe fn snoop_store(
    phase: Phase,
    new_value: *mut u8,
    pool: &mut NodePool<BufferNode>,
    snooped: &mut PrivateList<BufferNode>,
) {
    if !phase.snooping() || new_value.is_null() {
        return;
    }
    snooped.push_front(BufferNode::new(pool, new_value, false));
}

/// Helper to satisfy the borrow checker when the same `&Header` is
/// needed across branches below (a no-op re-borrow).
#[inline(always)]
fn header_as_ref(h: &Header) -> &Header {
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_node_tag_round_trips() {
        let mut pool = NodePool::new();
        let raw = 0x1000 as *mut u8;
        let node = unsafe { &*BufferNode::new(&mut pool, raw, true) };
        assert!(node.is_sentinel());
        assert_eq!(node.untagged_ptr(), raw);
    }

    #[test]
    fn deposit_segment_log_places_sentinel_at_head() {
        let mut pool = NodePool::new();
        let mut buffer = PrivateList::new();
        let parent = 0x2000 as *mut u8;
        let derived = vec![0x10 as *mut u8, 0x20 as *mut u8];
        let head = unsafe { deposit_segment_log(&mut pool, &mut buffer, parent, &derived) };
        let head_ref = unsafe { &*head };
        assert!(head_ref.is_sentinel());
        assert_eq!(head_ref.untagged_ptr(), parent);
    }
}
