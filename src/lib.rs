//! `tallow`: an on-the-fly (concurrent, non-stop-the-world) tracing
//! garbage collector core.
//!
//! A [`Gc`] owns every shared inventory — size-classed free/used lists,
//! the large-block buddy free list, the root set and write-barrier log
//! buffer, and the cross-mutator allocation dump. Each thread that
//! allocates registers a [`Mutator`] against it (`Gc::get_mutator`) and
//! polls `Mutator::poll_for_sync` at its own safepoints to stay in step
//! with the collector's six-phase handshake; `Gc::run` drives that
//! handshake plus the marker and sweeper on whichever thread the host
//! dedicates to collection.
//!
//! The host supplies object layout knowledge through two capability
//! traits — [`Tracer`] (how to find outgoing pointers) and [`Policy`]
//! (how to finalize a dying object) — rather than this crate carrying a
//! typed object model of its own. Both are ordinary generic trait bounds,
//! resolved at compile time.

pub mod barrier;
pub mod color;
pub mod config;
pub mod fixed_alloc;
pub mod gc;
pub mod header;
pub mod internal;
pub mod marker;
pub mod mutator;
pub mod phase;
pub mod stats;
pub mod sweeper;
pub mod util;
pub mod variable_alloc;

pub use color::Color;
pub use config::Config;
pub use gc::Gc;
pub use header::{header_of, Header};
pub use internal::policy::Policy;
pub use internal::trace::{Snapshot, Tracer};
pub use mutator::Mutator;
pub use phase::Phase;
pub use stats::HeapStatistics;

#[cfg(test)]
mod tests;
