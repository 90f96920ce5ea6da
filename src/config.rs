//! Tunable constants and the runtime `Config` struct, in a plain
//! struct-of-thresholds idiom.

/// Size in bytes of a small-object log-pointer or header slot.
pub const WORD_SIZE: usize = 8;

/// Bytes covered by a single log pointer in a large object's segment
/// table. Large objects are partitioned into `segment_size`-byte chunks,
/// each dirtied independently by the write barrier.
pub const SEGMENT_SIZE: usize = 64;

/// Payload sizes at or below this many bytes are allocated through the
/// fixed-size manager; larger payloads go to the variable-size manager.
pub const LARGE_OBJ_THRESHOLD: usize = 512;

/// `[log_ptr | header]` prefix size for a small object.
pub const SMALL_BLOCK_METADATA_SIZE: usize = 16;

/// `[size | split | prev | next | num_lp]` prefix size for a large object,
/// not counting its variable-length log-pointer table or its header.
pub const LARGE_BLOCK_METADATA_SIZE: usize = 40;

/// Bounded best-fit search depth for the variable-size manager's free list.
pub const SEARCH_DEPTH: usize = 32;

/// The marker checks its `running` flag for cooperative early abort every
/// this many objects traced.
pub const MARK_TICK_FREQUENCY: usize = 64;

/// The sweeper checks for early abort every this many stubs/blocks swept.
pub const TICK_FREQUENCY: usize = 32;

/// Node-pool chunk size: number of list nodes carved from one
/// `aligned_alloc` slab at a time.
pub const POOL_CHUNK_SIZE: usize = 64;

/// Number of distinct fixed size classes.
pub const SMALL_SIZE_CLASSES: usize = 7;

/// Starting power-of-two exponent for the smallest size class (8 bytes).
pub const SMALL_SIZE_CLASS_BASE_SHIFT: u32 = 3;

/// Number of chunk-size doublings a fixed-size manager's growth policy is
/// allowed before it plateaus.
pub const SMALL_BLOCK_SIZE_LIMIT: u32 = 6;

/// Knobs the collector and allocators read at run time; split out of the
/// constants above so callers can tune cadence without touching layout
/// invariants baked into object headers.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub mark_tick_frequency: usize,
    pub tick_frequency: usize,
    pub pool_chunk_size: usize,
    pub search_depth: usize,
    pub large_obj_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mark_tick_frequency: MARK_TICK_FREQUENCY,
            tick_frequency: TICK_FREQUENCY,
            pool_chunk_size: POOL_CHUNK_SIZE,
            search_depth: SEARCH_DEPTH,
            large_obj_threshold: LARGE_OBJ_THRESHOLD,
        }
    }
}
