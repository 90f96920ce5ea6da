//! The `Tracer` capability: supplied by the host to describe object
//! layout. Rendered as a monomorphized trait parameter (compile-time
//! polymorphism) rather than a vtable-indexed lookup, since the rest of
//! this crate is built generic over `Tracer`/`Policy` rather than over a
//! type-erased object model.

use crate::header::Header;

/// A snapshot taken by `copy_obj`/`copy_obj_segment`: an opaque pointer
/// the tracer itself knows how to interpret. `null` means "allocation of
/// the snapshot failed"; callers must tolerate that (§7: treat as
/// "dirtied retry").
pub type Snapshot = *mut u8;

/// Describes the layout a given header's descriptor bits refer to.
/// Implemented once per host object model; every operation here is
/// `unsafe` because it dereferences raw object/header pointers supplied
/// by the collector's internals.
pub trait Tracer {
    /// Number of log-pointer slots this object's layout has: `1` for
    /// small objects, one per 64-byte segment for large objects.
    unsafe fn num_log_ptrs(&self, header: &Header) -> usize;

    /// The log-pointer slot covering byte offset `seg * segment_size`
    /// inside the object at `obj_ptr`.
    unsafe fn log_ptr(&self, header: &Header, obj_ptr: *mut u8, seg: usize) -> *mut u8;

    /// Clones the whole object into a scratch buffer the marker owns
    /// until it calls `get_derived_ptrs`; returns null on allocation
    /// failure.
    unsafe fn copy_obj(&self, header: &Header, obj_ptr: *mut u8) -> Snapshot;

    /// Clones just one segment's worth of the object.
    unsafe fn copy_obj_segment(&self, header: &Header, obj_ptr: *mut u8, seg: usize) -> Snapshot;

    /// Extracts every outgoing pointer from a whole-object snapshot.
    unsafe fn get_derived_ptrs(&self, header: &Header, snapshot: Snapshot) -> Vec<*mut u8>;

    /// Extracts outgoing pointers found within one segment's snapshot.
    unsafe fn derived_ptrs_of_obj_segment(
        &self,
        header: &Header,
        snapshot: Snapshot,
        seg: usize,
    ) -> Vec<*mut u8>;
}
