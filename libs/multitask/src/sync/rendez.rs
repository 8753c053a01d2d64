// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::{Lock, Mutex, WaitList};
use crate::task::{self, Payload, TaskRef};
use core::any::TypeId;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

const BUCKETS: usize = 16;

/// Tasks parked in [`rendez`], hashed by tag.
static TABLE: [Mutex<WaitList>; BUCKETS] =
    [const { Mutex::const_new(Lock::new(), WaitList::new()) }; BUCKETS];

fn bucket(tag: usize) -> &'static Mutex<WaitList> {
    let hash = tag
        .to_ne_bytes()
        .iter()
        .fold(0_usize, |h, &b| {
            usize::from(b)
                .wrapping_add(h << 6)
                .wrapping_add(h << 16)
                .wrapping_sub(h)
        });
    &TABLE[hash % BUCKETS]
}

/// Exchanges `value` with the next task that calls `rendez` with the same
/// `tag`, from any runtime thread.
///
/// The first task to arrive parks until its partner shows up. Both calls
/// return the value the other one passed in. Pairs are formed in arrival
/// order.
///
/// # Panics
///
/// Panics when the partner exchanges a different type under the same tag,
/// and when called outside of a runtime thread.
pub fn rendez<T: Send + 'static>(tag: usize, value: T) -> T {
    let bucket = bucket(tag);
    let mut parked = bucket.lock();

    let partner = parked.remove_first(|t| {
        // Safety: the bucket owns the tasks parked in it
        match unsafe { t.payload() } {
            Payload::Rendez { tag: other, ty, .. } if other == tag => {
                assert_eq!(
                    ty,
                    TypeId::of::<T>(),
                    "rendezvous on tag {tag:#x} with mismatched types"
                );
                true
            }
            _ => false,
        }
    });

    if let Some(partner) = partner {
        drop(parked);
        // Safety: we just took `partner` out of the bucket, and its type was
        // checked above.
        let Payload::Rendez { slot, .. } = (unsafe { partner.payload() }) else {
            unreachable!()
        };
        // Safety: the slot lives on the partner's stack, which stays put
        // until we wake it.
        let theirs = unsafe { swap_slot(slot.cast::<Option<T>>(), value) };
        partner.wake();
        return theirs;
    }

    let slot = UnsafeCell::new(Some(value));
    let me = task::dequeue();
    // Safety: we are the task
    unsafe {
        me.set_payload(Payload::Rendez {
            tag,
            slot: NonNull::new_unchecked(slot.get()).cast(),
            ty: TypeId::of::<T>(),
        });
    }
    parked.push_back(me);
    drop(parked);

    task::park();
    // Safety: we are the task, and the partner is done with our slot
    unsafe { me.set_payload(Payload::None) };
    slot.into_inner()
        .expect("rendezvous partner left no value")
}

/// Puts `value` into a parked task's slot and returns what was there.
///
/// # Safety
///
/// `slot` must point at a live `Option<T>` owned by a task we hold parked.
unsafe fn swap_slot<T>(slot: NonNull<Option<T>>, value: T) -> T {
    // Safety: ensured by caller
    unsafe { (*slot.as_ptr()).replace(value) }.expect("parked task has no value to exchange")
}

/// A single-slot rendezvous point.
///
/// Unlike [`rendez`] it has no table and no lock: one atomic slot holds the
/// parked task, if any. Only ever two parties may use one at a time.
pub struct ARendez<T> {
    waiter: AtomicPtr<crate::task::Task>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send> Default for ARendez<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ARendez<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ARendez")
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl<T: Send> ARendez<T> {
    pub const fn new() -> Self {
        Self {
            waiter: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Exchanges `value` with the other party, parking until it arrives.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn exchange(&self, value: T) -> T {
        let slot = UnsafeCell::new(Some(value));
        let me = task::dequeue();
        // Safety: we are the task
        unsafe { me.set_payload(Payload::Slot(NonNull::new_unchecked(slot.get()).cast())) };

        loop {
            let cur = self.waiter.load(Ordering::Acquire);
            if let Some(partner) = NonNull::new(cur) {
                if self
                    .waiter
                    .compare_exchange(cur, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                task::undequeue();
                // Safety: we won the slot, so we own the parked partner
                let partner = unsafe { TaskRef::from_ptr(partner) };
                // Safety: see above, the payload was published before the
                // partner's CAS.
                let Payload::Slot(theirs) = (unsafe { partner.payload() }) else {
                    unreachable!("task parked on ARendez without a slot")
                };
                // Safety: the slot's type is fixed by `Self`
                let value = slot.into_inner().expect("own value missing");
                // Safety: see above
                let theirs = unsafe { swap_slot(theirs.cast::<Option<T>>(), value) };
                partner.wake();
                // Safety: we are the task
                unsafe { me.set_payload(Payload::None) };
                return theirs;
            }

            if self
                .waiter
                .compare_exchange(cur, me.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                task::park();
                // Safety: we are the task
                unsafe { me.set_payload(Payload::None) };
                return slot.into_inner().expect("partner left no value");
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::chan::Chan;
    use crate::test_util::trace_init;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn pair_exchanges_values() {
        let _trace = trace_init();

        let (a, b) = crate::run(|| {
            let got = Rc::new(RefCell::new(None));
            let g = got.clone();
            task::spawn(move || *g.borrow_mut() = Some(rendez(0x1000, "from spawned"))).unwrap();

            let mine = rendez(0x1000, "from root");
            task::yield_now();
            (mine, got.take().unwrap())
        });

        assert_eq!(a, "from spawned");
        assert_eq!(b, "from root");
    }

    #[test]
    fn tags_do_not_mix() {
        let _trace = trace_init();

        crate::run(|| {
            let results = Rc::new(RefCell::new(Vec::new()));
            for (tag, value) in [(1_usize, 10_u32), (1 + BUCKETS, 20)] {
                let results = results.clone();
                task::spawn(move || {
                    let got = rendez(tag, value);
                    results.borrow_mut().push((tag, got));
                })
                .unwrap();
            }
            task::yield_now();

            assert_eq!(rendez(1 + BUCKETS, 21_u32), 20);
            assert_eq!(rendez(1, 11_u32), 10);
            while Rc::strong_count(&results) > 1 {
                task::yield_now();
            }
            let mut results = results.take();
            results.sort_unstable();
            assert_eq!(results, [(1, 11), (1 + BUCKETS, 21)]);
        });
    }

    #[test]
    fn arendez_across_threads() {
        let _trace = trace_init();

        let point: Arc<ARendez<String>> = Arc::default();
        let done = Arc::new(Chan::new(1));

        let (p, d) = (point.clone(), done.clone());
        crate::spawn_thread(move || {
            let got = p.exchange(String::from("ping"));
            d.send(got).unwrap();
        })
        .unwrap();

        let (mine, theirs) = crate::run(move || {
            let mine = point.exchange(String::from("pong"));
            (mine, done.recv().unwrap())
        });
        assert_eq!(mine, "ping");
        assert_eq!(theirs, "pong");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// However tasks arrive, every value is received exactly once and
        /// each pair swaps values with each other.
        #[test]
        fn rendezvous_is_a_bijection(
            pairs in 1_usize..6,
            order in any::<u64>(),
        ) {
            let received = crate::run(move || {
                let received = Rc::new(RefCell::new(Vec::new()));
                let mut ids: Vec<usize> = (0..pairs * 2).collect();
                let mut state = order;
                for i in (1..ids.len()).rev() {
                    state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    let j = usize::try_from(state >> 33).unwrap() % (i + 1);
                    ids.swap(i, j);
                }

                for id in ids {
                    let received = received.clone();
                    task::spawn(move || {
                        for _ in 0..id % 3 {
                            task::yield_now();
                        }
                        let got = rendez(0xdead_0000 + id / 2, id);
                        received.borrow_mut().push((id, got));
                    })
                    .unwrap();
                }

                while Rc::strong_count(&received) > 1 {
                    task::yield_now();
                }
                received.take()
            });

            prop_assert_eq!(received.len(), pairs * 2);
            let mut seen: Vec<usize> = received.iter().map(|&(_, got)| got).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..pairs * 2).collect::<Vec<_>>());
            for (id, got) in received {
                prop_assert_eq!(got, id ^ 1);
            }
        }
    }
}
