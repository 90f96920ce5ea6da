//! Heap statistics reporting: a plain data struct plus a human-readable
//! `Display` impl with a K/M/G byte formatter, rather than a
//! metrics/tracing dependency.

use crate::config::{SMALL_SIZE_CLASSES, SMALL_SIZE_CLASS_BASE_SHIFT};
use crate::gc::Gc;
use crate::internal::large_block::{LargeBlock, LargeBlockList, SharedLargeBlockList};
use crate::internal::stub_list::{SharedStubList, StubList};

#[derive(Copy, Clone, Debug, Default)]
pub struct HeapStatistics {
    pub small_bytes_used: usize,
    pub small_bytes_free: usize,
    pub large_bytes_used: usize,
    pub large_bytes_free: usize,
    pub cycles_completed: usize,
}

impl HeapStatistics {
    /// Snapshots `gc`'s shared inventories. Each shared list is briefly
    /// vacated and immediately re-spliced back via `vacate_and_append`,
    /// the same round trip a handshake publication performs, so this may
    /// transiently interleave with an allocating mutator without losing
    /// any stub or block.
    pub fn collect(gc: &Gc) -> Self {
        let mut small_bytes_used = 0;
        let mut small_bytes_free = 0;
        for i in 0..SMALL_SIZE_CLASSES {
            let cell_size = 1usize << (SMALL_SIZE_CLASS_BASE_SHIFT + i as u32);
            small_bytes_used += unsafe { sum_and_restore_stubs(&gc.small_used[i], cell_size) };
            small_bytes_free += unsafe { sum_and_restore_stubs(&gc.small_free[i], cell_size) };
        }
        let large_bytes_used = unsafe { sum_and_restore_blocks(&gc.large_used) };
        let large_bytes_free = unsafe { sum_and_restore_blocks(&gc.large_free) };
        Self {
            small_bytes_used,
            small_bytes_free,
            large_bytes_used,
            large_bytes_free,
            cycles_completed: gc.cycles_completed(),
        }
    }

    pub fn total_used(&self) -> usize {
        self.small_bytes_used + self.large_bytes_used
    }

    pub fn total_reserved(&self) -> usize {
        self.small_bytes_used + self.small_bytes_free + self.large_bytes_used + self.large_bytes_free
    }
}

unsafe fn sum_and_restore_stubs(list: &SharedStubList, cell_size: usize) -> usize {
    let mut private = list.vacate();
    let mut bytes = 0usize;
    let mut rebuilt = StubList::new();
    loop {
        let stub = private.pop_front();
        if stub.is_null() {
            break;
        }
        bytes += (*stub).size * cell_size;
        rebuilt.push_front(stub);
    }
    list.vacate_and_append(rebuilt);
    bytes
}

unsafe fn sum_and_restore_blocks(list: &SharedLargeBlockList) -> usize {
    let mut private = list.vacate();
    let mut bytes = 0usize;
    let mut rebuilt = LargeBlockList::new();
    loop {
        let blk = private.pop_front();
        if blk.is_null() {
            break;
        }
        bytes += LargeBlock::from_raw(blk).byte_size();
        rebuilt.push_front(blk);
    }
    list.vacate_and_append(rebuilt);
    bytes
}

struct FormattedSize {
    size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;
        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }
        let msize = ksize / 1024f64;
        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }
        let gsize = msize / 1024f64;
        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Small objects: {} used, {} free",
            formatted_size(self.small_bytes_used),
            formatted_size(self.small_bytes_free)
        )?;
        writeln!(
            f,
            "  Large objects: {} used, {} free",
            formatted_size(self.large_bytes_used),
            formatted_size(self.large_bytes_free)
        )?;
        writeln!(
            f,
            "  Total reserved: {} ({} in use)",
            formatted_size(self.total_reserved()),
            formatted_size(self.total_used())
        )?;
        writeln!(f, "  GC cycles completed: {}", self.cycles_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_collector_reports_zeroed_statistics() {
        let gc = Gc::new();
        let stats = HeapStatistics::collect(&gc);
        assert_eq!(stats.total_reserved(), 0);
        assert_eq!(stats.cycles_completed, 0);
    }

    #[test]
    fn allocation_is_reflected_in_small_used_after_handshake() {
        let gc = Gc::new();
        let mut mutator = gc.get_mutator();
        let _ = mutator.allocate(16, 0, 0, 0);
        drop(mutator); // detach publishes the private used list
        let stats = HeapStatistics::collect(&gc);
        assert!(stats.small_bytes_used > 0);
    }
}
