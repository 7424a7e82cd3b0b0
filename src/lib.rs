//! Single-threaded cooperative event scheduler over kqueue and epoll.
//!
//! ## Example
//!
//! Run a task when a 10ms timer fires, then stop watching it.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use kernel_sched::event::Event;
//! use kernel_sched::link::Link;
//! use kernel_sched::sched::Scheduler;
//!
//! let mut sched = Scheduler::new().unwrap();
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let seen = Arc::clone(&fired);
//!
//! let event = Event::time(Duration::from_millis(10)).unwrap();
//! let link = Link::new(event, move |_link, _activation| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//! sched.dispatch(link, Some(false)).unwrap(); // One-shot.
//!
//! sched.wait(Duration::from_secs(1)).unwrap();
//! sched.execute();
//!
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! assert!(sched.operations().is_empty()); // Unregistered after firing.
//! ```
//!
//! The scheduler multiplexes three sources of work into one FIFO
//! pipeline drained by the owner thread:
//!
//! - kernel-reported events: process exits, POSIX signals, timers,
//!   filesystem changes and descriptor readiness,
//! - callables submitted from arbitrary threads through
//!   [`Handle::enqueue`][sched::Handle::enqueue],
//! - meta events: actuation, termination and the fault trap.
//!
//! Blocking waits are ended early by [`interrupt`][sched::Scheduler::interrupt],
//! delivered through the kernel's own user-trigger mechanism, so a
//! cross-thread submission is observed promptly.
//!
//! ## Backends
//!
//! epoll (with timerfd, pidfd, signalfd, inotify and eventfd) on Linux
//! and Android; kqueue on FreeBSD, NetBSD, DragonFly and Apple
//! platforms. Every descriptor is opened close-on-exec.

pub mod error;
pub mod event;
mod ffi;
pub mod link;
pub mod ports;
mod queue;
pub mod sched;
mod sys;
mod tasks;
