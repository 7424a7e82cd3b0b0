use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;
use libc::{epoll_event, itimerspec, timespec};

use super::{BACKLOG, WAKE_TOKEN};
use crate::event::{Event, EventKind};
use crate::ffi::syscall;

/// Interface to epoll.
///
/// The interrupt channel is a dedicated eventfd registered under
/// [`WAKE_TOKEN`]; [`Waker`] writes to it from any thread.
pub struct Selector {
    epoll: OwnedFd,
    wake: Arc<OwnedFd>,
}

impl Selector {
    /// epoll registrations survive a delivered `EPOLLONESHOT` event and
    /// must be deleted explicitly.
    pub const ONESHOT_PERSISTS: bool = true;

    pub fn new() -> Result<Selector> {
        let epoll = syscall::epoll_create1()?;
        let wake = Arc::new(syscall::eventfd(0)?);

        let mut ev = epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        syscall::epoll_ctl(
            epoll.as_fd(),
            libc::EPOLL_CTL_ADD,
            wake.as_raw_fd(),
            Some(&mut ev),
        )?;

        log::trace!(
            "open: epoll={}, wake={}",
            epoll.as_raw_fd(),
            wake.as_raw_fd()
        );
        Ok(Selector { epoll, wake })
    }

    pub fn waker(&self) -> Result<Waker> {
        Ok(Waker(Arc::clone(&self.wake)))
    }

    fn interest(event: &Event, cyclic: bool) -> Result<(RawFd, u32)> {
        let (fd, mut mask) = match event.kind() {
            EventKind::IoReceive => (event.port(), (libc::EPOLLIN | libc::EPOLLRDHUP) as u32),
            EventKind::IoTransmit => (event.port(), (libc::EPOLLOUT | libc::EPOLLET) as u32),
            EventKind::IoStatus => (
                event.port(),
                (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) as u32,
            ),
            EventKind::MetaException => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "exception traps are not kernel events",
                ))
            }
            _ => (event.port(), libc::EPOLLIN as u32),
        };
        if fd < 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "event carries no descriptor",
            ));
        }
        if !cyclic {
            mask |= libc::EPOLLONESHOT as u32;
        }
        Ok((fd, mask))
    }

    pub fn register(&self, event: &Event, token: u64, cyclic: bool) -> Result<()> {
        let (fd, mask) = Self::interest(event, cyclic)?;
        log::trace!("register: fd={}, token={}, mask={:#x}", fd, token, mask);

        let mut ev = epoll_event {
            events: mask,
            u64: token,
        };
        match syscall::epoll_ctl(self.epoll.as_fd(), libc::EPOLL_CTL_ADD, fd, Some(&mut ev)) {
            // The descriptor is already in the set; a displaced registration
            // for the same event lands here.
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                let mut ev = epoll_event {
                    events: mask,
                    u64: token,
                };
                syscall::epoll_ctl(self.epoll.as_fd(), libc::EPOLL_CTL_MOD, fd, Some(&mut ev))
            }
            other => other,
        }
    }

    pub fn deregister(&self, event: &Event) -> Result<()> {
        let fd = event.port();
        if fd < 0 {
            return Ok(());
        }
        log::trace!("deregister: fd={}", fd);
        match syscall::epoll_ctl(self.epoll.as_fd(), libc::EPOLL_CTL_DEL, fd, None) {
            // Already gone: the kernel dropped it when the descriptor closed.
            Err(e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Blocks for up to the given `(seconds, nanoseconds)` timeout,
    /// indefinitely when `None`.
    pub fn wait(&self, events: &mut Events, timeout: Option<(u64, u32)>) -> Result<usize> {
        let ms = match timeout {
            None => -1,
            Some((secs, nanos)) => secs
                .saturating_mul(1_000)
                .saturating_add(u64::from(nanos.div_ceil(1_000_000)))
                .min(i32::MAX as u64) as i32,
        };

        events.count = 0;
        let collected = syscall::epoll_wait(self.epoll.as_fd(), events.list.as_mut_slice(), ms)?;
        events.count = collected.len();
        Ok(events.count)
    }

    /// Consumes the pending wake so a level-triggered eventfd does not
    /// re-report it on the next wait.
    pub fn acknowledge_wake(&self) {
        let mut buf = [0u8; 8];
        let _ = syscall::read(self.wake.as_fd(), &mut buf);
    }

    /// Drains a level-triggered source after its event was collected.
    ///
    /// Without this, a fired timerfd/signalfd/inotify descriptor stays
    /// readable and the next wait returns immediately.
    pub fn drain(&self, event: &Event) {
        match event.kind() {
            EventKind::Time
            | EventKind::ProcessSignal
            | EventKind::FsStatus
            | EventKind::FsDelta
            | EventKind::FsVoid
            | EventKind::MetaActuate
            | EventKind::MetaTerminate
            | EventKind::Never => {}
            // Readiness and process-exit descriptors carry caller data or
            // cannot be consumed.
            _ => return,
        }
        if let Some(fd) = event.resource() {
            let mut buf = [0u8; 1024];
            loop {
                match syscall::read(fd, &mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    }
}

/// Writes the interrupt eventfd. Safe from any thread.
#[derive(Clone)]
pub struct Waker(Arc<OwnedFd>);

impl Waker {
    pub fn wake(&self) -> Result<()> {
        match syscall::write(self.0.as_fd(), &1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // Counter saturated: a wake is already pending.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Fixed-capacity collected-event array.
pub struct Events {
    list: ArrayVec<epoll_event, BACKLOG>,
    count: usize,
}

impl Events {
    pub fn new() -> Events {
        let mut list = ArrayVec::new();
        for _ in 0..BACKLOG {
            list.push(epoll_event { events: 0, u64: 0 });
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
        self.list[..self.count].iter().map(|ev| ev.u64)
    }
}

pub fn open_timer(period: Duration) -> Result<Option<OwnedFd>> {
    let fd = syscall::timerfd_create()?;
    let interval = timespec {
        tv_sec: period.as_secs() as _,
        tv_nsec: period.subsec_nanos() as _,
    };
    let spec = itimerspec {
        it_interval: interval,
        it_value: interval,
    };
    syscall::timerfd_settime(fd.as_fd(), &spec)?;
    Ok(Some(fd))
}

pub fn open_process(pid: libc::pid_t, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    match port {
        Some(fd) => Ok(Some(fd)),
        None => syscall::pidfd_open(pid).map(Some),
    }
}

pub fn open_signal(signo: i32, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    if let Some(fd) = port {
        return Ok(Some(fd));
    }
    // The signal must be blocked in this thread before the signalfd can
    // observe it.
    let mask = syscall::sigmask_block(signo)?;
    syscall::signalfd(&mask).map(Some)
}

pub fn open_fs(kind: EventKind, path: &Path, port: Option<OwnedFd>) -> Result<Option<OwnedFd>> {
    if let Some(fd) = port {
        return Ok(Some(fd));
    }
    let fd = syscall::inotify_init1()?;
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    syscall::inotify_add_watch(fd.as_fd(), &cpath, fs_mask(kind))?;
    Ok(Some(fd))
}

fn fs_mask(kind: EventKind) -> u32 {
    const VOID: u32 = libc::IN_DELETE_SELF | libc::IN_MOVE_SELF;
    const DELTA: u32 = libc::IN_MODIFY;
    match kind {
        EventKind::FsVoid => VOID,
        EventKind::FsDelta => DELTA,
        _ => VOID | DELTA | libc::IN_ATTRIB,
    }
}

pub fn open_user(armed: bool) -> Result<Option<OwnedFd>> {
    syscall::eventfd(armed as u32).map(Some)
}
