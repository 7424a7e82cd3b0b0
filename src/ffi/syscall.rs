use std::io::{Error, Result};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

pub fn dup_cloexec(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    let new = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if new != -1 {
        Ok(unsafe { OwnedFd::from_raw_fd(new) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize> {
    let bytes = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as _, buf.len()) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize> {
    let bytes = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as _, buf.len()) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::*;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use std::ffi::CStr;
    use std::io::{Error, Result};
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

    use libc::{epoll_event, itimerspec, sigset_t};

    pub fn epoll_create1() -> Result<OwnedFd> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn epoll_ctl(
        epoll: BorrowedFd<'_>,
        op: i32,
        fd: RawFd,
        event: Option<&mut epoll_event>,
    ) -> Result<()> {
        let ptr = event.map_or(std::ptr::null_mut(), |ev| ev as *mut epoll_event);
        let result = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, fd, ptr) };
        if result != -1 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn epoll_wait<'a>(
        epoll: BorrowedFd<'_>,
        events: &'a mut [epoll_event],
        timeout: i32,
    ) -> Result<&'a [epoll_event]> {
        let len = unsafe {
            libc::epoll_wait(
                epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as _,
                timeout,
            )
        };
        if len != -1 {
            Ok(&events[..len as _])
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn eventfd(init: u32) -> Result<OwnedFd> {
        let fd = unsafe { libc::eventfd(init, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn timerfd_create() -> Result<OwnedFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn timerfd_settime(fd: BorrowedFd<'_>, spec: &itimerspec) -> Result<()> {
        let result = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, spec, std::ptr::null_mut()) };
        if result != -1 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn signalfd(mask: &sigset_t) -> Result<OwnedFd> {
        let fd = unsafe { libc::signalfd(-1, mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn sigmask_block(signo: i32) -> Result<sigset_t> {
        unsafe {
            let mut mask = std::mem::zeroed::<sigset_t>();
            if libc::sigemptyset(&mut mask) == -1 || libc::sigaddset(&mut mask, signo) == -1 {
                return Err(Error::last_os_error());
            }
            let errno = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
            if errno == 0 {
                Ok(mask)
            } else {
                Err(Error::from_raw_os_error(errno))
            }
        }
    }

    pub fn pidfd_open(pid: libc::pid_t) -> Result<OwnedFd> {
        // No glibc wrapper yet, `PIDFD_NONBLOCK` is implied for polling use.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd as _) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn inotify_init1() -> Result<OwnedFd> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn inotify_add_watch(fd: BorrowedFd<'_>, path: &CStr, mask: u32) -> Result<i32> {
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), path.as_ptr(), mask) };
        if wd != -1 {
            Ok(wd)
        } else {
            Err(Error::last_os_error())
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use bsd::*;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod bsd {
    use std::ffi::CStr;
    use std::io::{Error, Result};
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

    use libc::timespec;

    pub fn kqueue() -> Result<OwnedFd> {
        let fd = unsafe { libc::kqueue() };
        if fd == -1 {
            return Err(Error::last_os_error());
        }
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(kq)
    }

    pub fn kevent<'a>(
        kq: BorrowedFd<'_>,
        changes: &[libc::kevent],
        events: &'a mut [libc::kevent],
        timeout: Option<&timespec>,
    ) -> Result<&'a [libc::kevent]> {
        let len = unsafe {
            libc::kevent(
                kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                events.as_mut_ptr(),
                events.len() as _,
                timeout.map_or(std::ptr::null(), |ts| ts as *const timespec),
            )
        };
        if len != -1 {
            Ok(&events[..len as _])
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn open_watched(path: &CStr) -> Result<OwnedFd> {
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let flags = libc::O_EVTONLY | libc::O_CLOEXEC;
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        let flags = libc::O_RDONLY | libc::O_CLOEXEC;

        let fd = unsafe { libc::open(path.as_ptr(), flags) };
        if fd != -1 {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        } else {
            Err(Error::last_os_error())
        }
    }
}
