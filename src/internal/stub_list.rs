//! Doubly linked list of "stubs" — runs of same-size-class cells carved
//! from a fixed-size manager's chunk — used by the sweeper's stride walk.
//! Mirrors `stub`/`stub_list` in `include/stub_list.hpp`.

use crossbeam_utils::atomic::AtomicCell;
use std::ptr::null_mut;

/// One run: `[start, start + size)` in units of cells of the owning size
/// class, doubly linked into the owning manager's used or free list.
pub struct Stub {
    pub start: usize,
    pub size: usize,
    next: *mut Stub,
    prev: *mut Stub,
}

impl Stub {
    pub fn new(start: usize, size: usize) -> *mut Stub {
        Box::into_raw(Box::new(Stub {
            start,
            size,
            next: null_mut(),
            prev: null_mut(),
        }))
    }
}

/// A plain (non-atomic) doubly linked list of stubs. Each fixed-size
/// manager keeps one used list and one free list of these, swept and
/// rebuilt by the collector's sweep pass.
pub struct StubList {
    head: *mut Stub,
    tail: *mut Stub,
    len: usize,
}

impl StubList {
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

    pub fn head(&self) -> *mut Stub {
        self.head
    }

    pub unsafe fn push_front(&mut self, stub: *mut Stub) {
        (*stub).prev = null_mut();
        (*stub).next = self.head;
        if !self.head.is_null() {
            (*self.head).prev = stub;
        }
        self.head = stub;
        if self.tail.is_null() {
            self.tail = stub;
        }
        self.len += 1;
    }

    pub unsafe fn push_back(&mut self, stub: *mut Stub) {
        (*stub).next = null_mut();
        (*stub).prev = self.tail;
        if !self.tail.is_null() {
            (*self.tail).next = stub;
        }
        self.tail = stub;
        if self.head.is_null() {
            self.head = stub;
        }
        self.len += 1;
    }

    pub unsafe fn pop_front(&mut self) -> *mut Stub {
        if self.head.is_null() {
            return null_mut();
        }
        let stub = self.head;
        self.head = (*stub).next;
        if self.head.is_null() {
            self.tail = null_mut();
        } else {
            (*self.head).prev = null_mut();
        }
        self.len -= 1;
        stub
    }

    pub unsafe fn pop_back(&mut self) -> *mut Stub {
        if self.tail.is_null() {
            return null_mut();
        }
        let stub = self.tail;
        self.tail = (*stub).prev;
        if self.tail.is_null() {
            self.head = null_mut();
        } else {
            (*self.tail).next = null_mut();
        }
        self.len -= 1;
        stub
    }

    /// Removes an arbitrary stub from the list.
    pub unsafe fn erase(&mut self, stub: *mut Stub) {
        let prev = (*stub).prev;
        let next = (*stub).next;
        if !prev.is_null() {
            (*prev).next = next;
        } else {
            self.head = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        } else {
            self.tail = prev;
        }
        (*stub).prev = null_mut();
        (*stub).next = null_mut();
        self.len -= 1;
    }

    /// Appends `other` to the end of `self`, emptying `other`.
    pub unsafe fn append(&mut self, other: &mut StubList) {
        if other.head.is_null() {
            return;
        }
        if self.tail.is_null() {
            self.head = other.head;
            self.tail = other.tail;
        } else {
            (*self.tail).next = other.head;
            (*other.head).prev = self.tail;
            self.tail = other.tail;
        }
        self.len += other.len;
        other.head = null_mut();
        other.tail = null_mut();
        other.len = 0;
    }
}

impl Default for StubList {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector's shared counterpart of `StubList`: `small_used_lists[i]`
/// / `small_free_lists[i]`. Lock-free push and vacate-and-append, same
/// embedded `prev`/`next` link fields.
pub struct SharedStubList {
    head: AtomicCell<*mut Stub>,
}

unsafe impl Send for SharedStubList {}
unsafe impl Sync for SharedStubList {}

impl SharedStubList {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_null()
    }

    pub unsafe fn push_front(&self, stub: *mut Stub) {
        let mut cur = self.head.load();
        loop {
            (*stub).prev = null_mut();
            (*stub).next = cur;
            if !cur.is_null() {
                (*cur).prev = stub;
            }
            match self.head.compare_exchange(cur, stub) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Detaches the whole shared chain into a private `StubList`.
    pub unsafe fn vacate(&self) -> StubList {
        let head = self.head.swap(null_mut());
        let mut len = 0;
        let mut tail = null_mut();
        let mut cur = head;
        while !cur.is_null() {
            tail = cur;
            len += 1;
            cur = (*cur).next;
        }
        StubList { head, tail, len }
    }

    /// Splices a private list onto the shared list's front in one CAS.
    pub unsafe fn vacate_and_append(&self, mut private: StubList) {
        if private.is_empty() {
            return;
        }
        let head = private.head;
        let tail = private.tail;
        let mut cur = self.head.load();
        loop {
            (*tail).next = cur;
            if !cur.is_null() {
                (*cur).prev = tail;
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

impl Default for SharedStubList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_front_and_back() {
        let mut list = StubList::new();
        unsafe {
            list.push_back(Stub::new(0, 1));
            list.push_back(Stub::new(1, 1));
            list.push_front(Stub::new(2, 1));
        }
        assert_eq!(list.len(), 3);
        unsafe {
            let front = list.pop_front();
            assert_eq!((*front).start, 2);
            drop(Box::from_raw(front));
            let back = list.pop_back();
            assert_eq!((*back).start, 1);
            drop(Box::from_raw(back));
        }
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn append_concatenates_and_empties_source() {
        let mut a = StubList::new();
        let mut b = StubList::new();
        unsafe {
            a.push_back(Stub::new(0, 1));
            b.push_back(Stub::new(1, 1));
            b.push_back(Stub::new(2, 1));
            a.append(&mut b);
        }
        assert_eq!(a.len(), 3);
        assert!(b.is_empty());
        unsafe {
            while !a.is_empty() {
                drop(Box::from_raw(a.pop_front()));
            }
        }
    }
}
