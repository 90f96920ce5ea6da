//! The collector's six-phase cycle and the handshake machinery mutators
//! poll at safepoints to stay in step with it.
//!
//! Phase order and the `snooping`/`tracing` predicates:
//! `snooping() == phase <= Second`, `tracing() == Second <= phase < Tracing`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    First = 0,
    Second = 1,
    Third = 2,
    Tracing = 3,
    Fourth = 4,
    Sweep = 5,
}

impl Phase {
    pub fn advance(self) -> Phase {
        match self {
            Phase::First => Phase::Second,
            Phase::Second => Phase::Third,
            Phase::Third => Phase::Tracing,
            Phase::Tracing => Phase::Fourth,
            Phase::Fourth => Phase::Sweep,
            Phase::Sweep => Phase::First,
        }
    }

    /// True while mutators must snapshot pre-images on pointer writes
    /// (First and Second).
    pub fn snooping(self) -> bool {
        (self as u8) <= (Phase::Second as u8)
    }

    /// True while the marker's invariants hold: a mutator writing a white
    /// pointer into a reachable object must log it (Second through the
    /// start of Tracing, inclusive of Tracing itself).
    pub fn tracing(self) -> bool {
        let p = self as u8;
        (Phase::Second as u8) <= p && p <= (Phase::Tracing as u8)
    }
}

/// Registration lock plus the active/shook counters used to drive the
/// mutator handshake. Every mutator registers here on attach and
/// deregisters on detach; the collector holds `reg_mut` while flipping
/// the global phase so that no mutator can observe a half-applied
/// transition.
pub struct PhaseState {
    phase: AtomicUsize,
    /// Number of currently-registered mutators.
    active: AtomicUsize,
    /// Number of registered mutators that have acknowledged the current
    /// phase since it was last advanced.
    shook: AtomicUsize,
    /// Held by the collector while advancing the phase, and by a mutator
    /// while registering or deregistering.
    reg_mut: Mutex<()>,
}

impl PhaseState {
    pub fn new() -> Self {
        Self {
            phase: AtomicUsize::new(Phase::First as usize),
            active: AtomicUsize::new(0),
            shook: AtomicUsize::new(0),
            reg_mut: Mutex::new(()),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::First,
            1 => Phase::Second,
            2 => Phase::Third,
            3 => Phase::Tracing,
            4 => Phase::Fourth,
            _ => Phase::Sweep,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn shook(&self) -> usize {
        self.shook.load(Ordering::Acquire)
    }

    /// Registers a new mutator. Must be called before the mutator performs
    /// its first allocation or write-barrier. A freshly registered
    /// mutator adopts the current phase as already-acknowledged (it was
    /// never behind on it), so both `active` and `shook` are bumped.
    pub fn register(&self) -> Phase {
        let _guard = self.reg_mut.lock();
        self.active.fetch_add(1, Ordering::AcqRel);
        self.shook.fetch_add(1, Ordering::AcqRel);
        self.phase()
    }

    /// Deregisters a mutator whose own last-observed phase was
    /// `mutator_phase`. If that still matches the published phase (the
    /// mutator is caught up and so already contributed to `shook` for
    /// it), `shook` is decremented along with `active` — this preserves
    /// `shook <= active` when the detach races a collector `try_advance`
    /// that already observed the old `shook` count.
    pub fn deregister(&self, mutator_phase: Phase) {
        let _guard = self.reg_mut.lock();
        self.active.fetch_sub(1, Ordering::AcqRel);
        if mutator_phase == self.phase() {
            self.shook.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Acquires `reg_mut` for the duration of `f`. Used both by mutators
    /// publishing private lists at a handshake point and by the collector
    /// while advancing the phase, so the two never interleave.
    pub fn with_reg_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.reg_mut.lock();
        f()
    }

    /// Records that the calling mutator has observed and acted on the
    /// current phase. The collector waits until `shook == active` before
    /// advancing past a phase that requires universal acknowledgment.
    pub fn acknowledge(&self) {
        self.shook.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by the collector once every registered mutator has shaken
    /// hands: advances the phase and resets the shook counter for the
    /// next one. Must be called while holding `reg_mut`.
    pub fn advance_locked(&self) -> Phase {
        let next = self.phase().advance();
        self.phase.store(next as usize, Ordering::Release);
        self.shook.store(0, Ordering::Release);
        next
    }

    pub fn all_shaken(&self) -> bool {
        self.shook() >= self.active()
    }
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snooping_and_tracing_match_reference_predicates() {
        assert!(Phase::First.snooping());
        assert!(Phase::Second.snooping());
        assert!(!Phase::Third.snooping());

        assert!(!Phase::First.tracing());
        assert!(Phase::Second.tracing());
        assert!(Phase::Third.tracing());
        assert!(Phase::Tracing.tracing());
        assert!(!Phase::Fourth.tracing());
    }

    #[test]
    fn advance_cycles_through_all_six_phases() {
        let mut p = Phase::First;
        for expect in [
            Phase::Second,
            Phase::Third,
            Phase::Tracing,
            Phase::Fourth,
            Phase::Sweep,
            Phase::First,
        ] {
            p = p.advance();
            assert_eq!(p, expect);
        }
    }

    #[test]
    fn register_deregister_tracks_active_count() {
        let state = PhaseState::new();
        let p = state.register();
        state.register();
        assert_eq!(state.active(), 2);
        state.deregister(p);
        assert_eq!(state.active(), 1);
    }
}
