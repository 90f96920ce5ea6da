//! Thread-local node pools: a bump allocator that carves fixed-size list
//! nodes out of `aligned_alloc`-backed chunks, handing back nodes through
//! an intrusive free list, going straight to a libc allocator rather than
//! through a Rust global allocator wrapper.

use std::mem::{align_of, size_of};
use std::ptr::null_mut;

use crate::config::POOL_CHUNK_SIZE;
use crate::internal::atomic_list::{AtomicList, ListLink};

/// A pool node wraps a `T`; the pool itself doesn't care what `T` is
/// beyond its size and alignment, but for the free list to thread through
/// unused slots we store a raw pointer union: unused nodes link through
/// the first word of their storage.
pub struct NodePool<T> {
    free: *mut T,
    chunk_cursor: *mut u8,
    chunk_end: *mut u8,
    chunk_nodes: usize,
    chunks: Vec<*mut u8>,
}

unsafe impl<T> Send for NodePool<T> {}

impl<T> NodePool<T> {
    pub fn new() -> Self {
        Self {
            free: null_mut(),
            chunk_cursor: null_mut(),
            chunk_end: null_mut(),
            chunk_nodes: POOL_CHUNK_SIZE,
            chunks: Vec::new(),
        }
    }

    fn alloc_chunk(&mut self) {
        let node_size = size_of::<T>().max(size_of::<*mut u8>());
        let align = align_of::<T>().max(align_of::<*mut u8>());
        let bytes = node_size * self.chunk_nodes;
        let layout_size = (bytes + align - 1) / align * align;
        let ptr = unsafe { libc::aligned_alloc(align, layout_size) } as *mut u8;
        assert!(!ptr.is_null(), "node pool chunk allocation failed");
        self.chunks.push(ptr);
        self.chunk_cursor = ptr;
        self.chunk_end = unsafe { ptr.add(node_size * self.chunk_nodes) };
    }

    /// Hands back a node, reusing the intrusive free list first and
    /// falling back to bump-allocating from (or growing) the current
    /// chunk.
    pub fn get(&mut self) -> *mut T {
        if !self.free.is_null() {
            let node = self.free;
            self.free = unsafe { *(node as *mut *mut T) };
            return node;
        }
        if self.chunk_cursor.is_null() || self.chunk_cursor >= self.chunk_end {
            self.alloc_chunk();
        }
        let node = self.chunk_cursor as *mut T;
        let node_size = size_of::<T>().max(size_of::<*mut u8>());
        self.chunk_cursor = unsafe { self.chunk_cursor.add(node_size) };
        node
    }

    /// Returns a node to the thread-local free list for reuse.
    pub unsafe fn put(&mut self, node: *mut T) {
        *(node as *mut *mut T) = self.free;
        self.free = node;
    }

    /// Drains the thread-local free list, clearing it. Used at mutator
    /// detach time to publish unreturned nodes to the shared allocation
    /// dump rather than leaking them.
    pub fn drain_free(&mut self) -> Vec<*mut T> {
        let mut out = Vec::new();
        while !self.free.is_null() {
            let node = self.free;
            self.free = unsafe { *(node as *mut *mut T) };
            out.push(node);
        }
        out
    }

    /// Hands over every backing chunk this pool has ever carved nodes
    /// from, resetting the pool to empty. Individual nodes carved from
    /// these chunks may still be reachable through shared lists (e.g. a
    /// published log buffer); the caller is responsible for not freeing
    /// the chunk until nothing can still read through one of its nodes.
    pub fn drain_chunks(&mut self) -> Vec<*mut u8> {
        self.free = null_mut();
        self.chunk_cursor = null_mut();
        self.chunk_end = null_mut();
        std::mem::take(&mut self.chunks)
    }
}

impl<T> Default for NodePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for NodePool<T> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            unsafe { libc::free(chunk as *mut libc::c_void) };
        }
    }
}

/// A raw, type-erased chunk pointer published to the shared
/// `allocation_dump` at mutator shutdown so the collector can `free()` it
/// once no live reference into it remains reachable.
pub struct DumpedChunk {
    pub ptr: *mut u8,
    next: *mut DumpedChunk,
}

impl ListLink for DumpedChunk {
    fn next_ptr(&self) -> *mut DumpedChunk {
        self.next
    }
    fn set_next_ptr(&mut self, next: *mut DumpedChunk) {
        self.next = next;
    }
}

/// Shared sink for node-pool chunks abandoned by detaching mutators and,
/// at collector shutdown, the collector's own node pools (`gc.hpp`'s
/// `run()` tail drains these before `destroy()` frees them).
pub struct AllocationDump {
    chunks: AtomicList<DumpedChunk>,
}

impl AllocationDump {
    pub fn new() -> Self {
        Self {
            chunks: AtomicList::new(),
        }
    }

    pub unsafe fn publish(&self, ptr: *mut u8) {
        let node = Box::into_raw(Box::new(DumpedChunk {
            ptr,
            next: null_mut(),
        }));
        self.chunks.push_front(node);
    }

    /// Frees every dumped chunk. Must only be called once nothing can
    /// still be tracing into objects carved from these chunks — i.e.
    /// after the collector has fully drained and is shutting down.
    pub unsafe fn free_all(&self) {
        loop {
            let node = self.chunks.take_front();
            if node.is_null() {
                break;
            }
            let boxed = Box::from_raw(node);
            libc::free(boxed.ptr as *mut libc::c_void);
        }
    }
}

impl Default for AllocationDump {
    fn default() -> Self {
        Self::new()
    }
}
