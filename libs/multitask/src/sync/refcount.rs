// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicUsize, Ordering};

/// An atomic reference count for structures that free themselves by hand.
///
/// Whoever sees [`RefCount::dec`] return `0` owns the last reference.
#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub const fn new(count: usize) -> Self {
        Self(AtomicUsize::new(count))
    }

    /// Adds a reference and returns the new count.
    pub fn inc(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops a reference and returns the remaining count.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the count was already zero.
    pub fn dec(&self) -> usize {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "reference count underflow");
        if prev == 1 {
            // Pairs with the release above on other threads, so the last
            // owner sees all their writes before freeing.
            core::sync::atomic::fence(Ordering::Acquire);
        }
        prev - 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new(1)
    }
}
