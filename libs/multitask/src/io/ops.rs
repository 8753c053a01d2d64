// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::state::{AtomicState, Phase};
use core::{fmt, mem};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// Tells a call running on an IO helper whether it was interrupted.
#[derive(Clone, Copy)]
pub struct CancelFlag<'a>(&'a AtomicState);

impl CancelFlag<'_> {
    /// Whether the call was cancelled, or its [`IoChan`] is being dropped.
    ///
    /// The helper gets a signal at the same time, so a blocking syscall
    /// fails with `EINTR` and should only be retried while this is unset.
    ///
    /// [`IoChan`]: super::IoChan
    pub fn is_set(self) -> bool {
        self.0.phase() != Phase::Running
    }
}

impl fmt::Debug for CancelFlag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelFlag").field(&self.is_set()).finish()
    }
}

/// One blocking call to run on an IO helper thread.
///
/// Results follow the syscall convention: a non-negative value on success,
/// the negated `errno` on failure.
pub enum IoRequest {
    /// `open(path, flags, mode)`, returns the new descriptor.
    Open {
        path: *const libc::c_char,
        flags: libc::c_int,
        mode: libc::mode_t,
    },
    /// One `read(2)`.
    Read {
        fd: libc::c_int,
        buf: *mut u8,
        len: usize,
    },
    /// Reads until `len` bytes arrived, end of file, or the call got
    /// cancelled. Returns the number of bytes read.
    ReadFull {
        fd: libc::c_int,
        buf: *mut u8,
        len: usize,
    },
    /// One `write(2)`.
    Write {
        fd: libc::c_int,
        buf: *const u8,
        len: usize,
    },
    /// Writes until all `len` bytes went out or the call got cancelled.
    /// Returns the number of bytes written.
    WriteAll {
        fd: libc::c_int,
        buf: *const u8,
        len: usize,
    },
    /// Sleeps for `duration`. Returns 0 when the full time passed and -1
    /// when interrupted, storing the time left in `remaining` either way.
    Sleep {
        duration: Duration,
        remaining: *mut Duration,
    },
    /// `waitpid(pid, status, options)`, returns the pid that changed state.
    WaitPid {
        pid: libc::pid_t,
        status: *mut libc::c_int,
        options: libc::c_int,
    },
    /// Any other procedure. A panic inside it comes back as `EIO`.
    Custom(Box<dyn FnOnce(CancelFlag<'_>) -> isize + Send>),
}

// Safety: the pointers are only dereferenced by the helper thread while
// the submitter keeps them alive, see `IoChan::submit`.
unsafe impl Send for IoRequest {}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { flags, mode, .. } => f
                .debug_struct("Open")
                .field("flags", flags)
                .field("mode", mode)
                .finish_non_exhaustive(),
            Self::Read { fd, len, .. } => f
                .debug_struct("Read")
                .field("fd", fd)
                .field("len", len)
                .finish_non_exhaustive(),
            Self::ReadFull { fd, len, .. } => f
                .debug_struct("ReadFull")
                .field("fd", fd)
                .field("len", len)
                .finish_non_exhaustive(),
            Self::Write { fd, len, .. } => f
                .debug_struct("Write")
                .field("fd", fd)
                .field("len", len)
                .finish_non_exhaustive(),
            Self::WriteAll { fd, len, .. } => f
                .debug_struct("WriteAll")
                .field("fd", fd)
                .field("len", len)
                .finish_non_exhaustive(),
            Self::Sleep { duration, .. } => f
                .debug_struct("Sleep")
                .field("duration", duration)
                .finish_non_exhaustive(),
            Self::WaitPid { pid, options, .. } => f
                .debug_struct("WaitPid")
                .field("pid", pid)
                .field("options", options)
                .finish_non_exhaustive(),
            Self::Custom(_) => f.debug_tuple("Custom").finish_non_exhaustive(),
        }
    }
}

impl IoRequest {
    /// Runs the call on the current thread.
    ///
    /// The looping variants check `state` between iterations and stop once
    /// the call is no longer [`Phase::Running`]. Custom calls get the same
    /// check as a [`CancelFlag`].
    ///
    /// # Safety
    ///
    /// Every pointer in the request must be valid for the access it
    /// describes.
    pub(crate) unsafe fn run(self, state: &AtomicState) -> isize {
        tracing::trace!(request = ?self, "running IO call");
        let cancel = CancelFlag(state);

        // Safety: pointers are valid, ensured by caller
        unsafe {
            match self {
                Self::Open { path, flags, mode } => {
                    cvt_int(libc::open(path, flags, libc::c_uint::from(mode)))
                }
                Self::Read { fd, buf, len } => cvt(libc::read(fd, buf.cast(), len)),
                Self::Write { fd, buf, len } => cvt(libc::write(fd, buf.cast(), len)),
                Self::ReadFull { fd, buf, len } => {
                    full(cancel, len, |n| libc::read(fd, buf.add(n).cast(), len - n))
                }
                Self::WriteAll { fd, buf, len } => {
                    full(cancel, len, |n| libc::write(fd, buf.add(n).cast(), len - n))
                }
                Self::Sleep {
                    duration,
                    remaining,
                } => {
                    let left = nanosleep(duration);
                    if !remaining.is_null() {
                        remaining.write(left);
                    }
                    if left.is_zero() { 0 } else { -1 }
                }
                Self::WaitPid {
                    pid,
                    status,
                    options,
                } => cvt_int(libc::waitpid(pid, status, options)),
                Self::Custom(f) => run_custom(f, cancel),
            }
        }
    }
}

/// Loops `op` until `len` bytes are through, retrying on `EINTR` unless the
/// call was cancelled.
fn full(cancel: CancelFlag<'_>, len: usize, mut op: impl FnMut(usize) -> isize) -> isize {
    let mut done = 0;
    while done < len && !cancel.is_set() {
        match op(done) {
            0 => break,
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return neg_errno(&err);
            }
            n => done += n.unsigned_abs(),
        }
    }
    isize::try_from(done).unwrap_or(isize::MAX)
}

fn run_custom(f: Box<dyn FnOnce(CancelFlag<'_>) -> isize + Send>, cancel: CancelFlag<'_>) -> isize {
    panic::catch_unwind(AssertUnwindSafe(move || f(cancel))).unwrap_or_else(|_| {
        tracing::error!("custom IO call panicked");
        neg_errno(&io::Error::from_raw_os_error(libc::EIO))
    })
}

fn nanosleep(duration: Duration) -> Duration {
    // Safety: zero is a valid timespec
    let mut request: libc::timespec = unsafe { mem::zeroed() };
    request.tv_sec = libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX);
    request.tv_nsec = duration.subsec_nanos().try_into().unwrap_or_default();
    // Safety: see above
    let mut left: libc::timespec = unsafe { mem::zeroed() };

    // Safety: both timespecs live on our stack
    if unsafe { libc::nanosleep(&raw const request, &raw mut left) } == 0 {
        return Duration::ZERO;
    }
    Duration::new(
        u64::try_from(left.tv_sec).unwrap_or_default(),
        u32::try_from(left.tv_nsec).unwrap_or_default(),
    )
}

fn cvt(ret: isize) -> isize {
    if ret < 0 {
        neg_errno(&io::Error::last_os_error())
    } else {
        ret
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "isize is at least 32 bits on every supported target"
)]
fn cvt_int(ret: libc::c_int) -> isize {
    cvt(ret as isize)
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "isize is at least 32 bits on every supported target"
)]
fn neg_errno(err: &io::Error) -> isize {
    -(err.raw_os_error().unwrap_or(libc::EIO) as isize)
}

/// Turns a syscall-style result back into an `io::Result`.
pub(crate) fn to_io_result(ret: isize) -> io::Result<usize> {
    usize::try_from(ret).map_err(|_| {
        let errno = i32::try_from(ret.unsigned_abs()).unwrap_or(libc::EIO);
        io::Error::from_raw_os_error(errno)
    })
}

/// The result of a call that never ran because another one is in flight.
pub(crate) fn busy() -> isize {
    neg_errno(&io::Error::from_raw_os_error(libc::EBUSY))
}
