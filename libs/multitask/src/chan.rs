// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded channel for tasks.
//!
//! [`Chan::send`] and [`Chan::recv`] park the calling task, and may be used
//! by tasks on different runtime threads. The non-blocking variants never
//! touch the scheduler, so plain OS threads can use them to feed values to
//! tasks.

use crate::sync::{Lock, Mutex, WaitList};
use crate::task::{self, Payload, TaskRef};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;

/// Returned by [`Chan::send`] when the channel is closed, carrying the value
/// that could not be sent.
#[derive(PartialEq, Eq, Clone, Copy, thiserror::Error)]
#[error("sending on a closed channel")]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SendError").finish_non_exhaustive()
    }
}

#[derive(PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TrySendError<T> {
    #[error("channel is full")]
    Full(T),
    #[error("sending on a closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("channel is closed and drained")]
    Closed,
}

pub struct Chan<T> {
    state: Mutex<State<T>>,
    closed: AtomicBool,
}

struct State<T> {
    buf: VecDeque<T>,
    cap: usize,
    /// Parked senders, each with `Payload::Slot` pointing at an
    /// `Option<T>` holding the value it wants to send.
    senders: WaitList,
    /// Parked receivers, each with `Payload::Slot` pointing at an empty
    /// `Option<T>` to be filled.
    receivers: WaitList,
}

impl<T> fmt::Debug for Chan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Chan")
            .field("len", &state.buf.len())
            .field("cap", &state.cap)
            .field("senders", &state.senders.len())
            .field("receivers", &state.receivers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Chan<T> {
    /// Creates a channel buffering up to `cap` values.
    ///
    /// With a capacity of 0 every send waits for a matching receive.
    pub fn new(cap: usize) -> Self {
        Self {
            state: Mutex::const_new(
                Lock::new(),
                State {
                    buf: VecDeque::with_capacity(cap),
                    cap,
                    senders: WaitList::new(),
                    receivers: WaitList::new(),
                },
            ),
            closed: AtomicBool::new(false),
        }
    }

    /// Sends `value`, parking the current task while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns the value back when the channel is or gets closed before the
    /// value was handed off.
    ///
    /// # Panics
    ///
    /// Panics when it has to park outside of a runtime thread.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.state.lock();
        let value = match self.offer(&mut state, value) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(value)) => return Err(SendError(value)),
            Err(TrySendError::Full(value)) => value,
        };

        let slot = UnsafeCell::new(Some(value));
        park_on(&mut state.senders, &slot);
        drop(state);
        task::park();

        // A receiver takes the value out of our slot. If it is still there
        // we were woken by `close`.
        match slot.into_inner() {
            None => Ok(()),
            Some(value) => Err(SendError(value)),
        }
    }

    /// Sends `value` if that is possible without waiting.
    ///
    /// Does not need a runtime thread.
    ///
    /// # Errors
    ///
    /// Returns the value back when the channel is full or closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.state.lock();
        self.offer(&mut state, value)
    }

    /// Receives the next value, parking the current task while the channel
    /// is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    ///
    /// # Panics
    ///
    /// Panics when it has to park outside of a runtime thread.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.state.lock();
        match self.take(&mut state) {
            Ok(value) => return Some(value),
            Err(TryRecvError::Closed) => return None,
            Err(TryRecvError::Empty) => {}
        }

        let slot = UnsafeCell::new(None);
        park_on(&mut state.receivers, &slot);
        drop(state);
        task::park();

        slot.into_inner()
    }

    /// Receives a value if one is available without waiting.
    ///
    /// Does not need a runtime thread.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] when there is nothing to receive and
    /// [`TryRecvError::Closed`] once the channel is closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Closes the channel and wakes every parked task.
    ///
    /// Buffered values can still be received. Returns `false` if the
    /// channel was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut woken = core::mem::take(&mut state.senders);
        woken.append_front(&mut state.receivers);
        drop(state);

        tracing::trace!(woken = woken.len(), "chan closed");
        while let Some(task) = woken.pop_front() {
            task.wake();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().cap
    }

    fn offer(&self, state: &mut State<T>, value: T) -> Result<(), TrySendError<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TrySendError::Closed(value));
        }

        if let Some(receiver) = state.receivers.pop_front() {
            debug_assert!(state.buf.is_empty());
            // Safety: we took the receiver off the list, so its slot is ours
            let prev = unsafe { slot_of::<T>(receiver).replace(value) };
            debug_assert!(prev.is_none());
            receiver.wake();
            return Ok(());
        }

        if state.buf.len() < state.cap {
            state.buf.push_back(value);
            Ok(())
        } else {
            Err(TrySendError::Full(value))
        }
    }

    fn take(&self, state: &mut State<T>) -> Result<T, TryRecvError> {
        let sender = state.senders.pop_front();
        let sent = sender.map(|sender| {
            // Safety: we took the sender off the list, so its slot is ours
            let value = unsafe { slot_of::<T>(sender).take() }
                .expect("parked sender without a value");
            (sender, value)
        });

        let value = match (state.buf.pop_front(), sent) {
            (Some(value), Some((sender, sent))) => {
                state.buf.push_back(sent);
                sender.wake();
                value
            }
            (Some(value), None) => value,
            (None, Some((sender, sent))) => {
                sender.wake();
                sent
            }
            (None, None) if self.closed.load(Ordering::Acquire) => {
                return Err(TryRecvError::Closed);
            }
            (None, None) => return Err(TryRecvError::Empty),
        };
        Ok(value)
    }
}

fn park_on<T>(list: &mut WaitList, slot: &UnsafeCell<Option<T>>) {
    let me = task::dequeue();
    // Safety: we are the task. `slot` lives on our stack until we are woken.
    unsafe { me.set_payload(Payload::Slot(NonNull::from(slot).cast())) };
    list.push_back(me);
}

/// # Safety
///
/// `task` must be parked on a channel of `T` and owned by the caller.
unsafe fn slot_of<'a, T>(task: TaskRef) -> &'a mut Option<T> {
    // Safety: ensured by caller
    let Payload::Slot(slot) = (unsafe { task.payload() }) else {
        unreachable!("task parked on a channel without a slot")
    };
    // Safety: ensured by caller
    unsafe { slot.cast::<Option<T>>().as_mut() }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn buffered_fifo() {
        let chan = Chan::new(3);
        for i in 0..3 {
            chan.try_send(i).unwrap();
        }
        assert_eq!(chan.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(chan.len(), 3);
        assert_eq!(
            (0..3).map(|_| chan.try_recv().unwrap()).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let chan = Chan::new(2);
        chan.try_send('a').unwrap();
        assert!(chan.close());
        assert!(!chan.close());
        assert_eq!(chan.try_send('b'), Err(TrySendError::Closed('b')));
        assert_eq!(chan.try_recv(), Ok('a'));
        assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn unbuffered_hands_off() {
        let _trace = trace_init();

        let got = crate::run(|| {
            let chan = Rc::new(Chan::new(0));
            let tx = chan.clone();
            task::spawn(move || {
                for i in 0..5 {
                    tx.send(i).unwrap();
                }
                tx.close();
            })
            .unwrap();

            let mut got = Vec::new();
            while let Some(v) = chan.recv() {
                got.push(v);
            }
            got
        });
        assert_eq!(got, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_sender_refills_buffer_in_order() {
        let _trace = trace_init();

        let got = crate::run(|| {
            let chan = Rc::new(Chan::new(1));
            for i in 0..3 {
                let tx = chan.clone();
                task::spawn(move || tx.send(i).unwrap()).unwrap();
            }
            // One value is buffered, two senders are parked behind it.
            task::yield_now();
            assert_eq!(chan.len(), 1);

            (0..3).map(|_| chan.recv().unwrap()).collect::<Vec<_>>()
        });
        assert_eq!(got, [0, 1, 2]);
    }

    #[test]
    fn close_wakes_parked_tasks() {
        let _trace = trace_init();

        crate::run(|| {
            let chan = Rc::new(Chan::<u32>::new(0));
            let outcomes = Rc::new(RefCell::new(Vec::new()));

            let (rx, out) = (chan.clone(), outcomes.clone());
            task::spawn(move || out.borrow_mut().push(format!("{:?}", rx.recv()))).unwrap();
            task::yield_now();
            chan.close();
            task::yield_now();

            let chan = Rc::new(Chan::<u32>::new(0));
            let (tx, out) = (chan.clone(), outcomes.clone());
            task::spawn(move || out.borrow_mut().push(format!("{:?}", tx.send(9)))).unwrap();
            task::yield_now();
            chan.close();
            task::yield_now();

            assert_eq!(*outcomes.borrow(), ["None", "Err(SendError(..))"]);
        });
    }

    #[test]
    fn plain_thread_feeds_task() {
        let _trace = trace_init();

        let chan = Arc::new(Chan::new(0));
        let tx = chan.clone();
        let sum = crate::run(move || {
            std::thread::spawn(move || {
                for i in 1..=10 {
                    // Unbuffered, so only succeeds once the task waits.
                    let mut v = i;
                    while let Err(TrySendError::Full(back)) = tx.try_send(v) {
                        v = back;
                        std::thread::yield_now();
                    }
                }
                tx.close();
            });

            let mut sum = 0;
            while let Some(v) = chan.recv() {
                sum += v;
            }
            sum
        });
        assert_eq!(sum, 55);
    }
}
