//! The sweeper (4.J): reclaims cells/blocks colored with the cycle's
//! `free_color`, coalescing adjacent runs, with cooperative early abort
//! and partial republishing.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::color::Color;
use crate::config::TICK_FREQUENCY;
use crate::header::Header;
use crate::internal::large_block::{coalesce, LargeBlock, LargeBlockList, SharedLargeBlockList};
use crate::internal::policy::Policy;
use crate::internal::stub_list::{SharedStubList, Stub, StubList};

unsafe fn header_at(cell: *mut u8) -> &'static Header {
    &*(cell.add(8) as *const Header)
}

/// Sweeps one small size class. Returns `true` if it ran to completion,
/// `false` if it aborted because `running` went false (in which case
/// both `used_list` and `free_list` have already received whatever was
/// processed so far — the next cycle will pick up cleanly because
/// membership of the untouched remainder is unchanged).
///
/// # Safety
/// Every live cell reachable from `used_list` must be laid out as
/// `[log_ptr(8) | header(8) | payload]`.
pub unsafe fn sweep_small_class<P: Policy>(
    cell_size: usize,
    used_list: &SharedStubList,
    free_list: &SharedStubList,
    free_color: Color,
    policy: &P,
    running: &AtomicBool,
) -> bool {
    let mut remaining_used = used_list.vacate();
    let mut processed_used = StubList::new();
    let mut processed_free = StubList::new();
    let mut ticks = 0usize;

    loop {
        let st = remaining_used.pop_front();
        if st.is_null() {
            break;
        }

        // Merge any immediately-following stubs contiguous with `st`.
        loop {
            let next = remaining_used.head();
            if next.is_null() {
                break;
            }
            let st_end = (*st).start + (*st).size * cell_size;
            if (*next).start == st_end {
                let merged = remaining_used.pop_front();
                (*st).size += (*merged).size;
                drop(Box::from_raw(merged));
            } else {
                break;
            }
        }

        let extent = (*st).start + (*st).size * cell_size;
        let mut offset = (*st).start;
        let mut run_start = offset;
        let mut run_free = false;
        let mut run_len = 0usize;

        while offset < extent {
            let cell = offset as *mut u8;
            let header = header_at(cell);
            let is_free_now = header.color(Ordering::Acquire) == free_color;

            if is_free_now {
                policy.destroy(header, cell.add(16));
                // destruct the log-pointer slot: zero it.
                *(cell as *mut u64) = 0;
            }

            if run_len == 0 {
                run_free = is_free_now;
                run_start = offset;
                run_len = cell_size;
            } else if is_free_now == run_free {
                run_len += cell_size;
            } else {
                emit_run(
                    run_start,
                    run_len,
                    cell_size,
                    run_free,
                    &mut processed_free,
                    &mut processed_used,
                );
                run_free = is_free_now;
                run_start = offset;
                run_len = cell_size;
            }

            offset += cell_size;
            ticks += 1;
            if ticks >= TICK_FREQUENCY {
                ticks = 0;
                free_list
                    .vacate_and_append(std::mem::replace(&mut processed_free, StubList::new()));
                if !running.load(Ordering::Acquire) {
                    emit_run(
                        run_start,
                        run_len,
                        cell_size,
                        run_free,
                        &mut processed_free,
                        &mut processed_used,
                    );
                    used_list.vacate_and_append(processed_used);
                    used_list.vacate_and_append(remaining_used);
                    free_list.vacate_and_append(processed_free);
                    return false;
                }
            }
        }
        if run_len > 0 {
            emit_run(
                run_start,
                run_len,
                cell_size,
                run_free,
                &mut processed_free,
                &mut processed_used,
            );
        }
        drop(Box::from_raw(st));
    }

    used_list.vacate_and_append(processed_used);
    free_list.vacate_and_append(processed_free);
    true
}

fn emit_run(
    start: usize,
    len: usize,
    cell_size: usize,
    is_free: bool,
    free_out: &mut StubList,
    used_out: &mut StubList,
) {
    if len == 0 {
        return;
    }
    let ncells = len / cell_size;
    let stub = Stub::new(start, ncells);
    unsafe {
        if is_free {
            free_out.push_front(stub);
        } else {
            used_out.push_front(stub);
        }
    }
}

/// Sweeps the large-object class, coalescing adjacent free-colored
/// buddies as it goes.
///
/// # Safety
/// Every live block reachable from `used_list` must be laid out per
/// `internal::large_block::LargeBlock`.
pub unsafe fn sweep_large_class<P: Policy>(
    used_list: &SharedLargeBlockList,
    free_list: &SharedLargeBlockList,
    free_color: Color,
    policy: &P,
    running: &AtomicBool,
) -> bool {
    let mut remaining_used = used_list.vacate();
    let mut processed_used = LargeBlockList::new();
    let mut processed_free = LargeBlockList::new();
    let mut ticks = 0usize;

    loop {
        let blk = remaining_used.pop_front();
        if blk.is_null() {
            break;
        }
        let b = LargeBlock::from_raw(blk);
        let header = b.header();
        if header.color(Ordering::Acquire) == free_color {
            policy.destroy(header, b.payload());
            for seg in 0..b.num_log_ptrs() {
                b.log_ptr_slot(seg as usize).store(0, Ordering::Relaxed);
            }
            // Try to coalesce with a free buddy already sitting in the
            // set assembled this pass. `coalesce` only ever unlinks the
            // buddy it finds, never `blk` itself, so `blk` must not be
            // in `processed_free` yet when this runs.
            let (merged, _class) = coalesce(blk, &mut processed_free);
            processed_free.push_front(merged);
        } else {
            processed_used.push_front(blk);
        }

        ticks += 1;
        if ticks >= TICK_FREQUENCY {
            ticks = 0;
            if !running.load(Ordering::Acquire) {
                used_list.vacate_and_append(processed_used);
                used_list.vacate_and_append(remaining_used);
                free_list.vacate_and_append(processed_free);
                return false;
            }
        }
    }

    used_list.vacate_and_append(processed_used);
    free_list.vacate_and_append(processed_free);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;
    use std::alloc::{alloc_zeroed, Layout};

    struct NoopPolicy;
    impl Policy for NoopPolicy {
        unsafe fn destroy(&self, _header: &Header, _header_ptr: *mut u8) {}
    }

    #[test]
    fn sweep_small_class_reclaims_free_colored_cells() {
        let cell_size = 32usize;
        let layout = Layout::from_size_align(cell_size * 2, 16).unwrap();
        let chunk = unsafe { alloc_zeroed(layout) };

        let used = SharedStubList::new();
        unsafe { used.push_front(Stub::new(chunk as usize, 2)) };

        // Cell 0: free-colored (White == free_color here). Cell 1: black.
        unsafe {
            header_at(chunk).set_color(Color::White, Ordering::Release);
            header_at(chunk.add(cell_size)).set_color(Color::Black, Ordering::Release);
        }

        let free = SharedStubList::new();
        let running = AtomicBool::new(true);
        let policy = NoopPolicy;
        let completed =
            unsafe { sweep_small_class(cell_size, &used, &free, Color::White, &policy, &running) };
        assert!(completed);
        assert!(!free.is_empty());
        assert!(!used.is_empty());

        unsafe { std::alloc::dealloc(chunk, layout) };
    }
}
