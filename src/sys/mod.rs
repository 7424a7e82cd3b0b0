//! Compile-time backend selection between the two kernel event mechanisms.
//!
//! Both backends expose the same surface: a `Selector` owning the kernel
//! descriptor, a `Waker` usable from any thread, an `Events` buffer for
//! collected records, and the per-kind resource openers used by
//! [`Event`][crate::event::Event] constructors.

/// Capacity of the collected-event array.
pub const BACKLOG: usize = 128;

/// User-data value reserved for the interrupt channel.
pub const WAKE_TOKEN: u64 = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::*;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use kqueue::*;
