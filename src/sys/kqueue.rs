use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use arrayvec::ArrayVec;
use libc::timespec;

use super::{BACKLOG, WAKE_TOKEN};
use crate::event::{Event, EventKind};
use crate::ffi::syscall;

/// Ident of the `EVFILT_USER` record that carries interrupts.
const WAKE_IDENT: usize = 0;

/// Interface to kqueue.
///
/// The interrupt channel is an `EVFILT_USER` filter keyed by
/// [`WAKE_IDENT`]; [`Waker`] triggers it through a duplicate of the
/// kqueue descriptor.
pub struct Selector {
    kq: OwnedFd,
}

impl Selector {
    /// `EV_ONESHOT` evicts the registration on delivery; no explicit
    /// delete is needed afterwards.
    pub const ONESHOT_PERSISTS: bool = false;

    pub fn new() -> Result<Selector> {
        let kq = syscall::kqueue()?;

        let wake = libc::kevent {
            ident: WAKE_IDENT as _,
            filter: libc::EVFILT_USER as _,
            flags: (libc::EV_ADD | libc::EV_CLEAR) as _,
            udata: WAKE_TOKEN as usize as _,
            ..unsafe { mem::zeroed() }
        };
        syscall::kevent(kq.as_fd(), &[wake], &mut [], None)?;

        log::trace!("open: kqueue={}", kq.as_raw_fd());
        Ok(Selector { kq })
    }

    pub fn waker(&self) -> Result<Waker> {
        // A duplicate keeps the wake path alive independently of the
        // selector's own descriptor.
        Ok(Waker(syscall::dup_cloexec(self.kq.as_fd())?))
    }

    fn identify(event: &Event, cyclic: bool) -> Result<libc::kevent> {
        let mut flags = libc::EV_ADD;
        if !cyclic {
            flags |= libc::EV_ONESHOT;
        }

        let mut fflags = 0u32;
        let mut data: libc::intptr_t = 0;
        let (filter, ident) = match event.kind() {
            EventKind::Time => {
                let period = event.period().unwrap_or(Duration::ZERO);
                let (unit, value) = timer_spec(period.as_nanos() as u64);
                fflags = unit;
                data = value;
                (libc::EVFILT_TIMER, event.token() as usize)
            }
            #[cfg(target_os = "freebsd")]
            EventKind::ProcessExit if event.port() >= 0 => {
                fflags = libc::NOTE_EXIT;
                (libc::EVFILT_PROCDESC, event.port() as usize)
            }
            EventKind::ProcessExit => {
                fflags = libc::NOTE_EXIT;
                (libc::EVFILT_PROC, event.pid().unwrap_or(0) as usize)
            }
            EventKind::ProcessSignal => {
                (libc::EVFILT_SIGNAL, event.signo().unwrap_or(0) as usize)
            }
            EventKind::IoReceive | EventKind::IoStatus => (libc::EVFILT_READ, event.port() as usize),
            EventKind::IoTransmit => {
                flags |= libc::EV_CLEAR;
                (libc::EVFILT_WRITE, event.port() as usize)
            }
            EventKind::FsStatus | EventKind::FsDelta | EventKind::FsVoid => {
                fflags = vnode_mask(event.kind());
                (libc::EVFILT_VNODE, event.port() as usize)
            }
            EventKind::MetaActuate => {
                // Already triggered when armed: fires on the first wait.
                fflags = libc::NOTE_TRIGGER;
                (libc::EVFILT_USER, event.token() as usize)
            }
            EventKind::MetaTerminate | EventKind::Never => {
                (libc::EVFILT_USER, event.token() as usize)
            }
            EventKind::MetaException => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "exception traps are not kernel events",
                ))
            }
        };

        Ok(libc::kevent {
            ident: ident as _,
            filter: filter as _,
            flags: flags as _,
            fflags: fflags as _,
            data: data as _,
            ..unsafe { mem::zeroed() }
        })
    }

    pub fn register(&self, event: &Event, token: u64, cyclic: bool) -> Result<()> {
        let mut rec = Self::identify(event, cyclic)?;
        rec.udata = token as usize as _;
        log::trace!(
            "register: filter={}, ident={}, token={}",
            rec.filter,
            rec.ident,
            token
        );
        syscall::kevent(self.kq.as_fd(), &[rec], &mut [], None)?;
        Ok(())
    }

    pub fn deregister(&self, event: &Event) -> Result<()> {
        let mut rec = Self::identify(event, true)?;
        rec.flags = libc::EV_DELETE as _;
        rec.fflags = 0;
        rec.data = 0;
        match syscall::kevent(self.kq.as_fd(), &[rec], &mut [], None) {
            Ok(_) => Ok(()),
            // Already gone: a oneshot delivery evicted it.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocks for up to the given `(seconds, nanoseconds)` timeout,
    /// indefinitely when `None`.
    pub fn wait(&self, events: &mut Events, timeout: Option<(u64, u32)>) -> Result<usize> {
        let ts = timeout.map(|(secs, nanos)| timespec {
            tv_sec: secs.min(libc::time_t::MAX as u64) as _,
            tv_nsec: nanos as _,
        });

        events.count = 0;
        let collected = syscall::kevent(
            self.kq.as_fd(),
            &[],
            events.list.as_mut_slice(),
            ts.as_ref(),
        )?;
        events.count = collected.len();
        Ok(events.count)
    }

    /// `EV_CLEAR` resets the wake filter on delivery; nothing to consume.
    pub fn acknowledge_wake(&self) {}

    /// kqueue filters are edge-reported; nothing to consume.
    pub fn drain(&self, _event: &Event) {}
}

/// Triggers the interrupt filter. Safe from any thread.
pub struct Waker(OwnedFd);

impl Waker {
    pub fn wake(&self) -> Result<()> {
        let rec = libc::kevent {
            ident: WAKE_IDENT as _,
            filter: libc::EVFILT_USER as _,
            flags: 0,
            fflags: libc::NOTE_TRIGGER as _,
            ..unsafe { mem::zeroed() }
        };
        syscall::kevent(self.0.as_fd(), &[rec], &mut [], None)?;
        Ok(())
    }
}

/// Fixed-capacity collected-event array.
pub struct Events {
    list: ArrayVec<libc::kevent, BACKLOG>,
    count: usize,
}

impl Events {
    pub fn new() -> Events {
        let mut list = ArrayVec::new();
        for _ in 0..BACKLOG {
            list.push(unsafe { mem::zeroed() });
        }
        Events { list, count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// User-data tokens of the collected records, in kernel order.
    pub fn tokens(&self) -> impl Iterator<Item = u64> + '_ {
        self.list[..self.count].iter().map(|ev| ev.udata as usize as u64)
    }
}

fn vnode_mask(kind: EventKind) -> u32 {
    const VOID: u32 = libc::NOTE_RENAME | libc::NOTE_DELETE | libc::NOTE_REVOKE;
    const DELTA: u32 = libc::NOTE_WRITE | libc::NOTE_EXTEND;
    match kind {
        EventKind::FsVoid => VOID,
        EventKind::FsDelta => DELTA,
        _ => VOID | DELTA | libc::NOTE_ATTRIB,
    }
}

/// Picks the coarsest `NOTE_*` timer unit that still preserves the
/// requested precision without overflowing the record's data field.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn timer_spec(ns: u64) -> (u32, libc::intptr_t) {
    if let Ok(value) = libc::intptr_t::try_from(ns) {
        return (libc::NOTE_NSECONDS, value);
    }
    if let Ok(value) = libc::intptr_t::try_from(ns / 1_000) {
        return (libc::NOTE_USECONDS, value);
    }
    // The data field defaults to milliseconds.
    if let Ok(value) = libc::intptr_t::try_from(ns / 1_000_000) {
        return (0, value);
    }
    let secs = (ns / 1_000_000_000).min(libc::intptr_t::MAX as u64);
    (libc::NOTE_SECONDS, secs as libc::intptr_t)
}

/// Milliseconds only on platforms without `NOTE_*` timer units.
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
fn timer_spec(ns: u64) -> (u32, libc::intptr_t) {
    let ms = (ns / 1_000_000).max(1).min(libc::intptr_t::MAX as u64);
    (0, ms as libc::intptr_t)
}

// Timers, processes, signals and user triggers are plain kqueue filters
// with no backing descriptor; only vnode watches open one.

pub fn open_timer(_period: Duration) -> Result<Option<OwnedFd>> {
    Ok(None)
}

pub fn open_process(_pid: libc::pid_t, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    Ok(port)
}

pub fn open_signal(_signo: i32, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    Ok(port)
}

pub fn open_fs(_kind: EventKind, path: &Path, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    if let Some(fd) = port {
        return Ok(Some(fd));
    }
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    syscall::open_watched(&cpath).map(Some)
}

pub fn open_user(_armed: bool) -> Result<Option<OwnedFd>> {
    Ok(None)
}
