// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interrupting a blocking call on another thread.
//!
//! A dedicated signal with an empty handler installed without `SA_RESTART`
//! makes the blocking syscall the target thread is sitting in return
//! `EINTR`. Delivery is best-effort: a signal that lands just before the
//! thread enters the syscall is lost, so callers retry with backoff.

use crate::Error;
use core::{fmt, mem, ptr};
use std::io;
use std::sync::OnceLock;

/// The signal used to interrupt IO helper threads.
pub(crate) fn cancel_signal() -> libc::c_int {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            libc::SIGRTMAX() - 1
        } else {
            libc::SIGUSR2
        }
    }
}

extern "C" fn on_cancel(_signal: libc::c_int) {}

/// Installs the cancel signal handler, once per process.
///
/// # Errors
///
/// Returns [`Error::Signal`] if the handler could not be installed, on this
/// and every later call.
pub(crate) fn install() -> Result<(), Error> {
    static INSTALLED: OnceLock<Option<i32>> = OnceLock::new();

    let failed = INSTALLED.get_or_init(|| {
        let signal = cancel_signal();
        // Safety: a zeroed sigaction is a valid "no flags, empty mask" value
        // that we fill in before use.
        let res = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_cancel as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigfillset(&raw mut action.sa_mask);
            libc::sigaction(signal, &raw const action, ptr::null_mut())
        };

        if res == 0 {
            tracing::debug!(signal, "installed IO cancel handler");
            None
        } else {
            let err = io::Error::last_os_error();
            tracing::error!(signal, %err, "failed to install IO cancel handler");
            Some(err.raw_os_error().unwrap_or(libc::EINVAL))
        }
    });

    match *failed {
        None => Ok(()),
        Some(code) => Err(Error::Signal(io::Error::from_raw_os_error(code))),
    }
}

/// Blocks every signal on the calling thread except the cancel signal.
///
/// # Errors
///
/// Returns the OS error if the mask could not be changed.
pub(crate) fn block_all_but_cancel() -> io::Result<()> {
    // Safety: `set` is initialized by `sigfillset` before it is read
    let res = unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&raw mut set);
        libc::sigdelset(&raw mut set, cancel_signal());
        libc::pthread_sigmask(libc::SIG_SETMASK, &raw const set, ptr::null_mut())
    };
    match res {
        0 => Ok(()),
        code => Err(io::Error::from_raw_os_error(code)),
    }
}

/// A handle to send the cancel signal to one thread.
#[derive(Clone, Copy)]
pub(crate) struct Interrupter(libc::pthread_t);

// Safety: a pthread_t is an opaque id, valid to use from any thread
unsafe impl Send for Interrupter {}
// Safety: see above
unsafe impl Sync for Interrupter {}

impl Interrupter {
    /// # Safety
    ///
    /// The thread must stay alive for as long as [`Self::interrupt`] may be
    /// called.
    pub(crate) unsafe fn new(thread: libc::pthread_t) -> Self {
        Self(thread)
    }

    pub(crate) fn interrupt(self) {
        // Safety: the thread is alive, ensured by `new`'s caller
        unsafe { libc::pthread_kill(self.0, cancel_signal()) };
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Interrupter").finish_non_exhaustive()
    }
}
