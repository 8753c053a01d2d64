// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking OS calls without blocking the runtime thread.
//!
//! An [`IoChan`] owns a helper OS thread that runs one blocking call at a
//! time on behalf of a task. The task parks on a channel until the result
//! comes back, so the rest of its runtime thread keeps going.
//!
//! A running call can be cut short, either right away with
//! [`IoChan::cancel`] or after a deadline with [`IoChan::set_alarm`]. Both
//! send a signal to the helper so its syscall returns `EINTR`. Signals can
//! race the helper entering the syscall, so they are repeated with
//! exponential backoff through the timer queue until the helper reports
//! back.

mod ops;
mod signal;
mod state;

pub use ops::{CancelFlag, IoRequest};

use self::signal::Interrupter;
use self::state::{AtomicState, Phase};
use crate::Error;
use crate::chan::Chan;
use crate::park::Semaphore;
use crate::sync::{Mutex, WaitList};
use crate::task;
use crate::time::{self, Remove, TimeQueue, Timed, TimerSlot};
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::thread::JoinHandleExt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Stack size of a helper thread before the caller's extra.
const IO_STACK_SIZE: usize = 64 * 1024;
/// First delay between cancel signals, doubled on every retry.
const CANCEL_BACKOFF: Duration = Duration::from_micros(10);
const NO_ALARM: usize = usize::MAX;

/// A helper thread for blocking calls.
///
/// The safe methods (`read`, `write_all`, `sleep`, ...) submit one call and
/// park the current task until its result is in. The raw interface is
/// [`IoChan::submit`] plus [`IoChan::recv`], which allows cancelling a
/// call from another task.
///
/// Dropping an `IoChan` interrupts a running call and waits for the helper
/// to let go of it before the helper exits.
pub struct IoChan {
    ctx: Arc<IoContext>,
}

struct IoContext {
    state: AtomicState,
    /// Results of completed calls.
    results: Chan<isize>,
    /// Epoch of the call the alarm is set for, or [`NO_ALARM`].
    alarm_epoch: AtomicUsize,
    /// Current delay between cancel signals, in nanoseconds.
    backoff: AtomicU64,
    /// Tasks waiting for the helper to give up an interrupted call. Holding
    /// this pins the phase of an interrupted call.
    cancelers: Mutex<WaitList>,
    /// Posted once per submission, or to tell the helper to exit.
    work: Semaphore,
    request: parking_lot::Mutex<Option<IoRequest>>,
    thread: OnceLock<Interrupter>,
    slot: TimerSlot,
    queue: &'static TimeQueue<dyn Timed>,
}

impl IoChan {
    /// Spawns a helper thread with `extra_stack` bytes on top of the
    /// default stack size.
    ///
    /// # Errors
    ///
    /// Returns an error if the cancel signal, the timer service or the
    /// helper thread could not be set up.
    pub fn new(extra_stack: usize) -> Result<Self, Error> {
        signal::install()?;
        let queue = time::shared_queue()?;
        queue.reserve()?;

        let ctx = Arc::new(IoContext {
            state: AtomicState::new(),
            results: Chan::new(1),
            alarm_epoch: AtomicUsize::new(NO_ALARM),
            backoff: AtomicU64::new(0),
            cancelers: Mutex::new(WaitList::new()),
            work: Semaphore::new(),
            request: parking_lot::Mutex::new(None),
            thread: OnceLock::new(),
            slot: TimerSlot::new(),
            queue,
        });

        let spawned = std::thread::Builder::new()
            .name("multitask-io".into())
            .stack_size(IO_STACK_SIZE + extra_stack)
            .spawn({
                let ctx = ctx.clone();
                move || ctx.helper_main()
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                queue.release();
                return Err(Error::Thread(err));
            }
        };

        // Safety: the helper only exits after taking itself out of the timer
        // queue and after draining `cancelers`. Every signal is sent from an
        // expiring timer or by a task about to join `cancelers`.
        let interrupter = unsafe { Interrupter::new(handle.as_pthread_t()) };
        ctx.thread
            .set(interrupter)
            .expect("IO helper registered twice");

        Ok(Self { ctx })
    }

    /// Hands `request` to the helper thread.
    ///
    /// Returns `false`, without running anything, when a call is still
    /// outstanding. The result arrives through [`Self::recv`].
    ///
    /// # Safety
    ///
    /// Every pointer in `request` must stay valid until the result was
    /// received, or until this `IoChan` is dropped.
    pub unsafe fn submit(&self, request: IoRequest) -> bool {
        let Some(epoch) = self.ctx.state.begin() else {
            tracing::warn!(?request, "IO call submitted while another is in flight");
            return false;
        };
        tracing::trace!(epoch, ?request, "submit");

        self.ctx.alarm_epoch.store(NO_ALARM, Ordering::Release);
        *self.ctx.request.lock() = Some(request);
        self.ctx.work.post();
        true
    }

    /// Parks the current task until the next result arrives.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn recv(&self) -> isize {
        self.ctx
            .results
            .recv()
            .expect("IO result channel is never closed")
    }

    pub fn try_recv(&self) -> Option<isize> {
        self.ctx.results.try_recv().ok()
    }

    /// Interrupts the running call and waits for the helper to give it up.
    /// If the call is already being interrupted, by an alarm or another
    /// task, this waits for that instead.
    ///
    /// Returns the call's result if it produced one, which may well be an
    /// `EINTR` error or a partial transfer.
    ///
    /// # Panics
    ///
    /// Panics when a call is running and this is called outside of a
    /// runtime thread.
    pub fn cancel(&self) -> Option<isize> {
        self.interrupt_call(Phase::Canceled);
        self.try_recv()
    }

    /// Cancels the running call once `timeout` passed, replacing an earlier
    /// alarm. `None` or a zero timeout clears the alarm.
    ///
    /// The alarm only ever applies to the call running right now. Returns
    /// `false` if there is none.
    pub fn set_alarm(&self, timeout: Option<Duration>) -> bool {
        let current = self.ctx.state.load();
        if current.phase() != Phase::Running {
            return false;
        }

        let mut queue = self.ctx.queue.lock();
        queue.remove(&*self.ctx, Remove::empty());
        match timeout {
            Some(timeout) if !timeout.is_zero() => {
                self.ctx
                    .alarm_epoch
                    .store(current.epoch(), Ordering::Release);
                queue.insert(self.ctx.clone(), timeout);
            }
            _ => self.ctx.alarm_epoch.store(NO_ALARM, Ordering::Release),
        }
        true
    }

    /// Moves the running call to `phase`, or joins an interruption already
    /// underway, and parks until the helper gave the call up.
    ///
    /// Returns `false` without parking when no call is running.
    fn interrupt_call(&self, phase: Phase) -> bool {
        let ctx = &*self.ctx;
        let mut cancelers = ctx.cancelers.lock();
        loop {
            let current = ctx.state.load();
            match current.phase() {
                Phase::Running => {
                    // Lost against the helper finishing or the alarm firing.
                    if !ctx.state.transition(current, phase) {
                        continue;
                    }
                    tracing::trace!(epoch = current.epoch(), ?phase, "interrupting IO call");

                    // The helper can't release its timer slot before we let go
                    // of `cancelers`.
                    let mut queue = ctx.queue.lock();
                    queue.remove(ctx, Remove::empty());
                    ctx.backoff.store(nanos(CANCEL_BACKOFF), Ordering::Relaxed);
                    queue.insert(self.ctx.clone(), CANCEL_BACKOFF);
                    drop(queue);
                    ctx.interrupt();
                }
                Phase::Canceled if phase == Phase::Moribund => {
                    let escalated = ctx.state.transition(current, Phase::Moribund);
                    debug_assert!(escalated, "interrupted IO call changed phase");
                    tracing::trace!(epoch = current.epoch(), "tearing down interrupted IO call");
                }
                Phase::Canceled => {}
                Phase::Waiting | Phase::Moribund => return false,
            }
            break;
        }

        cancelers.push_back(task::dequeue());
        drop(cancelers);
        task::park();
        true
    }

    fn call(&mut self, request: IoRequest) -> isize {
        while self.try_recv().is_some() {}
        // Safety: `&mut self` keeps everyone else from taking our result, so
        // we wait for it below, and the helper is done with the request once
        // it delivered the result.
        if unsafe { self.submit(request) } {
            self.recv()
        } else {
            ops::busy()
        }
    }

    /// Opens `path`.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the `open` call.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn open(
        &mut self,
        path: &CStr,
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<OwnedFd> {
        let fd = ops::to_io_result(self.call(IoRequest::Open {
            path: path.as_ptr(),
            flags: flags | libc::O_CLOEXEC,
            mode,
        }))?;
        let fd = libc::c_int::try_from(fd).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        // Safety: `open` just returned this descriptor to us
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Reads once into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the `read` call.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn read(&mut self, fd: impl AsFd, buf: &mut [u8]) -> io::Result<usize> {
        ops::to_io_result(self.call(IoRequest::Read {
            fd: fd.as_fd().as_raw_fd(),
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        }))
    }

    /// Reads once into `buf`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an [`io::ErrorKind::Interrupted`] error if the timeout hit
    /// before any data arrived, and the OS error of the `read` call
    /// otherwise.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn read_timeout(
        &mut self,
        fd: impl AsFd,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        while self.try_recv().is_some() {}
        let request = IoRequest::Read {
            fd: fd.as_fd().as_raw_fd(),
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        };
        // Safety: as in `call`
        if !unsafe { self.submit(request) } {
            return ops::to_io_result(ops::busy());
        }
        self.set_alarm(Some(timeout));
        ops::to_io_result(self.recv())
    }

    /// Fills `buf` completely, unless end of file comes first. Returns the
    /// number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the first OS error other than `EINTR`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn read_full(&mut self, fd: impl AsFd, buf: &mut [u8]) -> io::Result<usize> {
        ops::to_io_result(self.call(IoRequest::ReadFull {
            fd: fd.as_fd().as_raw_fd(),
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        }))
    }

    /// Writes once from `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the `write` call.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn write(&mut self, fd: impl AsFd, buf: &[u8]) -> io::Result<usize> {
        ops::to_io_result(self.call(IoRequest::Write {
            fd: fd.as_fd().as_raw_fd(),
            buf: buf.as_ptr(),
            len: buf.len(),
        }))
    }

    /// Writes all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns the first OS error other than `EINTR`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn write_all(&mut self, fd: impl AsFd, buf: &[u8]) -> io::Result<()> {
        let written = ops::to_io_result(self.call(IoRequest::WriteAll {
            fd: fd.as_fd().as_raw_fd(),
            buf: buf.as_ptr(),
            len: buf.len(),
        }))?;
        if written < buf.len() {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        Ok(())
    }

    /// Runs `f` on the helper thread.
    ///
    /// `f` returns a syscall-style result and should check its
    /// [`CancelFlag`] whenever a blocking call it makes fails with `EINTR`.
    ///
    /// # Errors
    ///
    /// Returns the error `f` reported as a negated `errno`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn call_with<F>(&mut self, f: F) -> io::Result<usize>
    where
        F: FnOnce(CancelFlag<'_>) -> isize + Send + 'static,
    {
        ops::to_io_result(self.call(IoRequest::Custom(Box::new(f))))
    }

    /// Sleeps on the helper thread.
    ///
    /// # Errors
    ///
    /// Returns the time left if the sleep was interrupted.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Duration> {
        let mut remaining = duration;
        match self.call(IoRequest::Sleep {
            duration,
            remaining: &raw mut remaining,
        }) {
            0 => Ok(()),
            _ => Err(remaining),
        }
    }

    /// Waits for the child `pid` to change state, returning its pid and
    /// status.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the `waitpid` call.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime thread.
    pub fn wait_pid(
        &mut self,
        pid: libc::pid_t,
        options: libc::c_int,
    ) -> io::Result<(libc::pid_t, libc::c_int)> {
        let mut status = 0;
        let pid = ops::to_io_result(self.call(IoRequest::WaitPid {
            pid,
            status: &raw mut status,
            options,
        }))?;
        let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        Ok((pid, status))
    }
}

impl fmt::Debug for IoChan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChan")
            .field("state", &self.ctx.state)
            .field("thread", &self.ctx.thread.get())
            .finish_non_exhaustive()
    }
}

impl Drop for IoChan {
    fn drop(&mut self) {
        if self.interrupt_call(Phase::Moribund) {
            return;
        }

        // Idle helper. A leftover alarm must not fire on a helper that is
        // about to exit.
        let mut queue = self.ctx.queue.lock();
        queue.remove(&*self.ctx, Remove::empty());
        let prev = self.ctx.state.swap_phase(Phase::Moribund);
        drop(queue);
        debug_assert_eq!(prev.phase(), Phase::Waiting);

        *self.ctx.request.lock() = None;
        self.ctx.work.post();
    }
}

impl IoContext {
    fn helper_main(&self) {
        if let Err(err) = signal::block_all_but_cancel() {
            tracing::warn!(%err, "failed to mask signals on IO helper");
        }
        tracing::debug!("IO helper started");

        loop {
            self.work.wait();
            let Some(request) = self.request.lock().take() else {
                break;
            };
            // Safety: the submitter keeps the request's memory alive until it
            // received the result, see `IoChan::submit`.
            let result = unsafe { request.run(&self.state) };
            if !self.finish(result) {
                break;
            }
        }

        self.queue.remove(self, Remove::FREE);
        tracing::debug!("IO helper exiting");
    }

    /// Delivers a call's result and goes back to waiting. Returns `false`
    /// when the helper has to exit.
    fn finish(&self, result: isize) -> bool {
        // Deliver before going back to `Waiting`, after that a new call may
        // be submitted and must not see our result.
        if self.state.phase() != Phase::Moribund {
            let _ = self.results.try_send(result);
        }

        let current = self.state.load();
        if current.phase() == Phase::Running && self.state.transition(current, Phase::Waiting) {
            return true;
        }

        let mut cancelers = self.cancelers.lock();
        let prev = self.state.swap_phase(Phase::Waiting);
        while let Some(canceler) = cancelers.pop_front() {
            canceler.wake();
        }
        drop(cancelers);

        match prev.phase() {
            Phase::Canceled => true,
            Phase::Moribund => false,
            phase => unreachable!("interrupted IO call finished in {phase:?}"),
        }
    }

    fn interrupt(&self) {
        if let Some(thread) = self.thread.get() {
            thread.interrupt();
        }
    }
}

impl Timed for IoContext {
    fn timer_slot(&self) -> &TimerSlot {
        &self.slot
    }

    fn expire(&self) -> Option<Duration> {
        let current = self.state.load();
        match current.phase() {
            Phase::Canceled | Phase::Moribund => {
                // The helper has not seen the cancellation yet, say it louder.
                self.interrupt();
                let next = self.backoff.load(Ordering::Relaxed).saturating_mul(2);
                self.backoff.store(next, Ordering::Relaxed);
                Some(Duration::from_nanos(next))
            }
            Phase::Running
                if self.alarm_epoch.load(Ordering::Acquire) == current.epoch()
                    && self.state.transition(current, Phase::Canceled) =>
            {
                tracing::trace!(epoch = current.epoch(), "IO alarm fired");
                self.interrupt();
                self.backoff.store(nanos(CANCEL_BACKOFF), Ordering::Relaxed);
                Some(CANCEL_BACKOFF)
            }
            _ => None,
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_util::trace_init;
    use core::ptr;
    use core::sync::atomic::AtomicBool;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Instant;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // Safety: `fds` has room for both ends
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // Safety: fresh descriptors we own
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn reads_prefilled_pipe() {
        let _trace = trace_init();

        let got = crate::run(|| {
            let (rx, tx) = pipe();
            let mut io = IoChan::new(0).unwrap();
            io.write_all(&tx, b"hello").unwrap();

            let mut buf = [0_u8; 5];
            assert_eq!(io.read_full(&rx, &mut buf).unwrap(), 5);
            buf
        });
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn cancel_then_reuse() {
        let _trace = trace_init();

        crate::run(|| {
            let (rx, tx) = pipe();
            let mut io = IoChan::new(0).unwrap();
            let mut buf = [0_u8; 8];

            // Safety: `buf` outlives the call, we cancel before it goes away
            assert!(unsafe {
                io.submit(IoRequest::Read {
                    fd: rx.as_raw_fd(),
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                })
            });
            let result = io.cancel();
            assert_eq!(result, Some(-isize::try_from(libc::EINTR).unwrap()));

            io.write_all(&tx, b"again").unwrap();
            assert_eq!(io.read(&rx, &mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], b"again");
        });
    }

    #[test]
    fn second_submit_is_rejected() {
        let _trace = trace_init();

        crate::run(|| {
            let io = IoChan::new(0).unwrap();
            // Safety: no pointers involved
            unsafe {
                assert!(io.submit(IoRequest::Sleep {
                    duration: Duration::from_millis(20),
                    remaining: ptr::null_mut(),
                }));
                assert!(!io.submit(IoRequest::Sleep {
                    duration: Duration::ZERO,
                    remaining: ptr::null_mut(),
                }));
            }
            assert_eq!(io.recv(), 0);
        });
    }

    #[test]
    fn alarm_interrupts_blocked_read() {
        let _trace = trace_init();

        crate::run(|| {
            let (rx, _tx) = pipe();
            let mut io = IoChan::new(0).unwrap();
            let mut buf = [0_u8; 8];

            let start = Instant::now();
            let err = io
                .read_timeout(&rx, &mut buf, Duration::from_millis(20))
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::Interrupted);
            assert!(start.elapsed() >= Duration::from_millis(20));
        });
    }

    #[test]
    fn stale_alarm_spares_next_call() {
        let _trace = trace_init();

        crate::run(|| {
            let (rx, tx) = pipe();
            let mut io = IoChan::new(0).unwrap();
            let mut buf = [0_u8; 4];

            io.write_all(&tx, b"ab").unwrap();
            // Completes well before the alarm.
            assert_eq!(
                io.read_timeout(&rx, &mut buf, Duration::from_millis(10))
                    .unwrap(),
                2
            );

            // Runs past the old alarm's deadline, which must not cut it short.
            io.sleep(Duration::from_millis(40)).unwrap();
        });
    }

    #[test]
    fn tasks_run_while_helper_blocks() {
        let _trace = trace_init();

        crate::run(|| {
            let ticks = Rc::new(Cell::new(0_u32));
            let t = ticks.clone();
            task::spawn(move || {
                while t.get() < 1000 {
                    t.set(t.get() + 1);
                    task::yield_now();
                }
            })
            .unwrap();

            let mut io = IoChan::new(0).unwrap();
            io.sleep(Duration::from_millis(10)).unwrap();
            assert!(ticks.get() > 0);
        });
    }

    #[test]
    fn drop_while_blocked() {
        let _trace = trace_init();

        crate::run(|| {
            let (rx, _tx) = pipe();
            let mut buf = [0_u8; 8];

            for round in 0..32_u64 {
                let io = IoChan::new(0).unwrap();
                // Safety: dropping `io` waits for the helper to give up `buf`
                assert!(unsafe {
                    io.submit(IoRequest::Read {
                        fd: rx.as_raw_fd(),
                        buf: buf.as_mut_ptr(),
                        len: buf.len(),
                    })
                });
                // Drops before, while and after the helper enters `read`.
                std::thread::sleep(Duration::from_micros(round * 25));
                drop(io);
            }
        });
    }

    #[test]
    fn cancel_waits_for_fired_alarm() {
        let _trace = trace_init();

        crate::run(|| {
            let mut io = IoChan::new(0).unwrap();
            // `thread::sleep` resumes after every interruption.
            let request = IoRequest::Custom(Box::new(|_| {
                std::thread::sleep(Duration::from_millis(30));
                7
            }));
            // Safety: no pointers involved
            assert!(unsafe { io.submit(request) });
            assert!(io.set_alarm(Some(Duration::from_millis(1))));

            time::sleep(Duration::from_millis(5)).unwrap();
            assert_eq!(io.ctx.state.phase(), Phase::Canceled);

            assert_eq!(io.cancel(), Some(7));
            assert_eq!(io.ctx.state.phase(), Phase::Waiting);
            io.sleep(Duration::from_millis(1)).unwrap();
        });
    }

    #[test]
    fn drop_waits_for_fired_alarm() {
        let _trace = trace_init();

        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        crate::run(move || {
            let io = IoChan::new(0).unwrap();
            let request = IoRequest::Custom(Box::new(move |_| {
                std::thread::sleep(Duration::from_millis(20));
                f.store(true, Ordering::Release);
                0
            }));
            // Safety: no pointers involved
            assert!(unsafe { io.submit(request) });
            assert!(io.set_alarm(Some(Duration::from_millis(1))));

            time::sleep(Duration::from_millis(5)).unwrap();
            drop(io);
        });
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn custom_call_runs_on_helper() {
        let _trace = trace_init();

        let got = crate::run(|| {
            let mut io = IoChan::new(0).unwrap();
            io.call_with(|cancel| {
                assert!(!cancel.is_set());
                isize::from(std::thread::current().name() == Some("multitask-io"))
            })
            .unwrap()
        });
        assert_eq!(got, 1);
    }

    #[test]
    fn custom_call_stops_on_cancel() {
        let _trace = trace_init();

        crate::run(|| {
            let (rx, _tx) = pipe();
            let fd = rx.as_raw_fd();
            let io = IoChan::new(0).unwrap();

            let request = IoRequest::Custom(Box::new(move |cancel| {
                loop {
                    let mut byte = 0_u8;
                    // Safety: reading one byte into a local
                    let ret = unsafe { libc::read(fd, (&raw mut byte).cast(), 1) };
                    if ret >= 0 {
                        return ret;
                    }
                    if cancel.is_set() {
                        return -isize::try_from(libc::EINTR).unwrap();
                    }
                }
            }));
            // Safety: `rx` outlives the call, we cancel before it goes away
            assert!(unsafe { io.submit(request) });
            task::yield_now();

            assert_eq!(io.cancel(), Some(-isize::try_from(libc::EINTR).unwrap()));
        });
    }

    #[test]
    fn waits_for_child() {
        let _trace = trace_init();

        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = libc::pid_t::try_from(child.id()).unwrap();

        let (waited, status) = crate::run(move || {
            let mut io = IoChan::new(0).unwrap();
            io.wait_pid(pid, 0).unwrap()
        });
        assert_eq!(waited, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
