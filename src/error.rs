use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scheduler surface.
///
/// Task faults are not part of this enum: a task that panics is diverted
/// to the trap link (or logged) and never propagates out of
/// [`Scheduler::execute`][crate::Scheduler::execute].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Allocation, descriptor or queue capacity exhausted.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The call itself was malformed: unknown event kind, a cyclic
    /// override on a kind that cannot repeat, re-actuation, and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A syscall failed and the failure is not transparently retryable.
    #[error("kernel error: {0}")]
    Kernel(#[from] io::Error),

    /// The scheduler (or its kernel queue) has already been closed.
    #[error("scheduler is closed")]
    Closed,

    /// A link was invoked while its task was already running.
    #[error("link is already executing")]
    AlreadyExecuting,
}

impl Error {
    /// The raw `errno` for kernel errors, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Kernel(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
