//! The concurrent marker (4.I): walks the published root set, coloring
//! reachable objects with the cycle's endpoint color, consulting
//! per-segment log pointers for large objects and `Tracer`'s snapshot
//! helpers for anything not yet dirtied. Mirrors `include/marker.hpp`.
//! Runs single-threaded, on the collector thread.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::barrier::BufferNode;
use crate::color::Color;
use crate::config::MARK_TICK_FREQUENCY;
use crate::header::header_of;
use crate::internal::atomic_list::ListLink;
use crate::internal::node_pool::NodePool;
use crate::internal::trace::Tracer;

/// A simple intrusive LIFO stack over any `ListLink` node. The marker's
/// worklist doesn't need tail tracking (it's never appended to another
/// list), so this is lighter than `PrivateList`.
struct Worklist<T: ListLink> {
    head: *mut T,
}

impl<T: ListLink> Worklist<T> {
    fn new(head: *mut T) -> Self {
        Self { head }
    }

    fn push(&mut self, node: *mut T) {
        unsafe { (*node).set_next_ptr(self.head) };
        self.head = node;
    }

    fn pop(&mut self) -> *mut T {
        if self.head.is_null() {
            return null_mut();
        }
        let node = self.head;
        self.head = unsafe { (*node).next_ptr() };
        node
    }
}

pub struct Marker {
    work: Worklist<BufferNode>,
    /// Scratch pool for derived pointers discovered while marking.
    /// Entries popped off `work` (including the ones vacated from the
    /// published root set) are never individually freed — per 4.A, node
    /// storage is released only by draining a whole backing chunk, not
    /// node-by-node — so this pool's chunks are the marker's own to
    /// drain and release once the pass completes.
    pool: NodePool<BufferNode>,
    ticks_since_check: usize,
    tick_frequency: usize,
}

impl Marker {
    /// `roots` is the head of the vacated `root_set` (plain, untagged
    /// `BufferNode`s).
    pub fn new(roots: *mut BufferNode) -> Self {
        Self {
            work: Worklist::new(roots),
            pool: NodePool::new(),
            ticks_since_check: 0,
            tick_frequency: MARK_TICK_FREQUENCY,
        }
    }

    /// Hands back whatever is left on the worklist (non-null only after
    /// an aborted `mark`), for the caller to republish into the shared
    /// root set so the next cycle picks up correctly.
    pub fn into_remaining(self) -> *mut BufferNode {
        self.work.head
    }

    /// Releases every chunk this pass carved scratch nodes from. Must
    /// only be called once nothing still walks those nodes — i.e. after
    /// `mark` returns and any unfinished worklist has been republished
    /// elsewhere (republished nodes live in chunks that are NOT drained
    /// here; only nodes this marker fully consumed are backed by them).
    pub fn release_pool(&mut self) {
        for chunk in self.pool.drain_chunks() {
            unsafe { libc::free(chunk as *mut libc::c_void) };
        }
    }

    /// Traces every reachable object to `endpoint_color`, returning
    /// `true` if it ran to completion and `false` if it aborted early
    /// because `running` went false.
    ///
    /// # Safety
    /// Every pointer reachable from the root set must be a live object
    /// payload pointer laid out per this crate's conventions, and
    /// `tracer` must describe that same layout.
    pub unsafe fn mark<T: Tracer>(&mut self, tracer: &T, endpoint_color: Color, running: &AtomicBool) -> bool {
        loop {
            let node = self.work.pop();
            if node.is_null() {
                return true;
            }
            // `node` is backed by some pool's slab (either this pass's own
            // scratch pool or the publishing mutator's), never an
            // individual heap allocation — read through it, don't free it.
            let ptr = (*node).untagged_ptr();
            if !ptr.is_null() {
                self.mark_indiv(tracer, ptr, endpoint_color);
            }

            self.ticks_since_check += 1;
            if self.ticks_since_check >= self.tick_frequency {
                self.ticks_since_check = 0;
                if !running.load(Ordering::Acquire) {
                    return false;
                }
            }
        }
    }

    unsafe fn push_root(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.work.push(BufferNode::new(&mut self.pool, ptr, false));
    }

    unsafe fn mark_indiv<T: Tracer>(&mut self, tracer: &T, obj: *mut u8, endpoint_color: Color) {
        let header = header_of(obj);
        let start_color = header.color(Ordering::Acquire);
        if start_color == endpoint_color {
            return;
        }
        let num_lp = tracer.num_log_ptrs(header);
        if num_lp == 0 {
            let snapshot = tracer.copy_obj(header, obj);
            if !snapshot.is_null() {
                let derived = tracer.get_derived_ptrs(header, snapshot);
                for p in derived {
                    self.push_root(p);
                }
            }
        } else {
            for seg in 0..num_lp {
                let lp = tracer.log_ptr(header, obj, seg) as *mut AtomicUsize;
                let slot = (*lp).load(Ordering::Acquire);
                if slot == 0 {
                    let snapshot = tracer.copy_obj_segment(header, obj, seg);
                    if !snapshot.is_null() {
                        let derived = tracer.derived_ptrs_of_obj_segment(header, snapshot, seg);
                        for p in derived {
                            self.push_root(p);
                        }
                    }
                } else {
                    // Dirtied: walk the buffer run starting at the
                    // sentinel, pushing every subsequent non-sentinel
                    // entry as a root until the next tagged node (the
                    // start of a different write barrier's run).
                    let mut cur = slot as *mut BufferNode;
                    // skip the leading sentinel itself
                    cur = (*cur).next_ptr();
                    while !cur.is_null() {
                        let node = &*cur;
                        if node.is_sentinel() {
                            break;
                        }
                        self.push_root(node.untagged_ptr());
                        cur = node.next_ptr();
                    }
                }
            }
        }
        header.try_recolor(start_color, endpoint_color);
    }
}
