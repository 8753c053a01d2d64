// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use mycelium_bitfield::{bitfield, enum_from_bits};

bitfield! {
    /// The state word of an IO context.
    #[derive(Eq, PartialEq)]
    pub(crate) struct State<usize> {
        /// Where the current call is in its lifecycle.
        pub(crate) const PHASE: Phase;
        /// Bumped by every submission. Cancellations and alarms compare
        /// against the full word, so they can only ever hit the call they
        /// were aimed at.
        pub(crate) const EPOCH = ..;
    }
}

enum_from_bits! {
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum Phase<u8> {
        /// No call outstanding, the helper is waiting for work.
        Waiting = 0b00,
        /// A call was submitted and has not completed.
        Running = 0b01,
        /// The running call is being interrupted. Its result, if any, is
        /// still delivered.
        Canceled = 0b10,
        /// The context is being torn down. The helper exits after the
        /// running call, dropping its result.
        Moribund = 0b11,
    }
}

impl State {
    pub(crate) fn phase(self) -> Phase {
        self.get(Self::PHASE)
    }

    pub(crate) fn epoch(self) -> usize {
        self.get(Self::EPOCH)
    }

    pub(crate) fn with_phase(self, phase: Phase) -> Self {
        self.with(Self::PHASE, phase)
    }

    /// The state after submitting a new call.
    fn next_call(self) -> Self {
        let epoch = (self.epoch() + 1) & Self::EPOCH.max_value();
        self.with(Self::EPOCH, epoch).with_phase(Phase::Running)
    }
}

/// An atomically updated [`State`].
pub(crate) struct AtomicState(AtomicUsize);

impl AtomicState {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub(crate) fn load(&self) -> State {
        State::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn phase(&self) -> Phase {
        self.load().phase()
    }

    pub(crate) fn compare_exchange(&self, current: State, new: State) -> Result<State, State> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(State::from_bits)
            .map_err(State::from_bits)
    }

    /// Switches to `phase` if the word still equals `current`.
    pub(crate) fn transition(&self, current: State, phase: Phase) -> bool {
        self.compare_exchange(current, current.with_phase(phase))
            .is_ok()
    }

    /// Sets the phase, keeping the epoch, and returns the previous state.
    pub(crate) fn swap_phase(&self, phase: Phase) -> State {
        let mut current = self.load();
        loop {
            match self.compare_exchange(current, current.with_phase(phase)) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Starts a new call if none is outstanding, returning its epoch.
    pub(crate) fn begin(&self) -> Option<usize> {
        let current = self.load();
        if current.phase() != Phase::Waiting {
            return None;
        }
        let next = current.next_call();
        self.compare_exchange(current, next).ok()?;
        Some(next.epoch())
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn begin_bumps_epoch() {
        let state = AtomicState::new();
        assert_eq!(state.phase(), Phase::Waiting);

        let first = state.begin().unwrap();
        assert_eq!(state.phase(), Phase::Running);
        assert_eq!(state.begin(), None);

        state.swap_phase(Phase::Waiting);
        let second = state.begin().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn stale_word_cannot_transition() {
        let state = AtomicState::new();
        state.begin().unwrap();
        let stale = state.load();

        state.swap_phase(Phase::Waiting);
        state.begin().unwrap();

        assert!(!state.transition(stale, Phase::Canceled));
        assert_eq!(state.phase(), Phase::Running);
        assert!(state.transition(state.load(), Phase::Canceled));
        assert_eq!(state.phase(), Phase::Canceled);
    }

    #[test]
    fn phases_fit_in_two_bits() {
        State::assert_valid();
    }
}
