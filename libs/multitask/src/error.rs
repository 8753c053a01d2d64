// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

/// Errors returned when creating tasks, threads or runtime subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mapping a task stack (or growing a bookkeeping array) failed.
    #[error("failed to allocate task resources")]
    Alloc(#[source] io::Error),
    /// The OS refused to create a thread.
    #[error("failed to spawn OS thread")]
    Thread(#[source] io::Error),
    /// The IO cancellation signal handler could not be installed.
    #[error("failed to install the IO cancellation signal handler")]
    Signal(#[source] io::Error),
    /// The timer service failed to start earlier and stays disabled.
    #[error("timer service is unavailable")]
    TimerUnavailable,
}

impl Error {
    pub(crate) fn out_of_memory() -> Self {
        Self::Alloc(io::Error::from(io::ErrorKind::OutOfMemory))
    }
}
