//! The lock-free singly linked list used for every shared inventory in the
//! collector: used/free lists, the root set, the write-barrier buffer set,
//! and the cross-mutator allocation dump.
//!
//! `vacate` and `vacate_and_append` splice a private (single-threaded)
//! list onto the front of the shared list in one CAS, without reordering
//! or duplicating either list.

use crossbeam_utils::atomic::AtomicCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Implemented by any node type stored in an `AtomicList`. Nodes own their
/// own link field; the list never allocates.
pub trait ListLink {
    fn next_ptr(&self) -> *mut Self;
    fn set_next_ptr(&mut self, next: *mut Self);
}

pub struct AtomicList<T: ListLink> {
    head: AtomicCell<*mut T>,
    count: AtomicUsize,
}

unsafe impl<T: ListLink> Send for AtomicList<T> {}
unsafe impl<T: ListLink> Sync for AtomicList<T> {}

impl<T: ListLink> AtomicList<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn head(&self) -> *mut T {
        self.head.load()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_null()
    }

    /// Pushes a single node onto the front of the shared list.
    pub unsafe fn push_front(&self, node: *mut T) {
        let mut cur = self.head.load();
        loop {
            (*node).set_next_ptr(cur);
            match self.head.compare_exchange(cur, node) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Pops a single node from the front of the shared list, or returns
    /// null if empty.
    pub fn take_front(&self) -> *mut T {
        loop {
            let head = self.head.load();
            if head.is_null() {
                return null_mut();
            }
            let next = unsafe { (*head).next_ptr() };
            if self.head.compare_exchange(head, next).is_ok() {
                self.count.fetch_sub(1, Ordering::AcqRel);
                return head;
            }
        }
    }

    /// Atomically detaches the entire shared list, returning its former
    /// head. The caller now owns the returned chain exclusively.
    pub fn vacate(&self) -> *mut T {
        let head = self.head.swap(null_mut());
        if !head.is_null() {
            self.count.store(0, Ordering::Release);
        }
        head
    }

    /// Splices a private list (`priv_head ..= priv_tail`, already linked
    /// through `set_next_ptr`, of `priv_len` nodes) onto the front of the
    /// shared list in one CAS loop: the shared list's current contents
    /// become the private tail's successor, so neither list's internal
    /// order is disturbed.
    pub unsafe fn vacate_and_append(&self, priv_head: *mut T, priv_tail: *mut T, priv_len: usize) {
        if priv_head.is_null() {
            return;
        }
        debug_assert!(!priv_tail.is_null());
        let mut cur = self.head.load();
        loop {
            (*priv_tail).set_next_ptr(cur);
            match self.head.compare_exchange(cur, priv_head) {
                Ok(_) => {
                    self.count.fetch_add(priv_len, Ordering::AcqRel);
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }
}

impl<T: ListLink> Default for AtomicList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A private, single-threaded list built from the same `ListLink` nodes.
/// Mutators accumulate freed/allocated nodes here between handshakes and
/// publish them all at once via `AtomicList::vacate_and_append`.
pub struct PrivateList<T: ListLink> {
    head: *mut T,
    tail: *mut T,
    len: usize,
}

impl<T: ListLink> PrivateList<T> {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self) -> *mut T {
        self.head
    }

    pub unsafe fn push_front(&mut self, node: *mut T) {
        (*node).set_next_ptr(self.head);
        self.head = node;
        if self.tail.is_null() {
            self.tail = node;
        }
        self.len += 1;
    }

    pub unsafe fn pop_front(&mut self) -> *mut T {
        if self.head.is_null() {
            return null_mut();
        }
        let head = self.head;
        self.head = (*head).next_ptr();
        if self.head.is_null() {
            self.tail = null_mut();
        }
        self.len -= 1;
        head
    }

    /// Hands the whole private chain to `dst`, leaving this list empty.
    pub unsafe fn publish_to(&mut self, dst: &AtomicList<T>) {
        if self.head.is_null() {
            return;
        }
        dst.vacate_and_append(self.head, self.tail, self.len);
        self.head = null_mut();
        self.tail = null_mut();
        self.len = 0;
    }
}

impl<T: ListLink> Default for PrivateList<T> {
    fn default() -> Self {
        Self::new()
    }
}
