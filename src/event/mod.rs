
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ffi::syscall;
use crate::sys;

/// User reference retained on an event for introspection.
pub type Source = Arc<dyn Any + Send + Sync>;

/// What an [`Event`] watches. Determines how the kernel resource is
/// interpreted and whether the registration repeats by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Disabled placeholder; never fires.
    Never,
    /// One-shot user trigger; fires once on dispatch.
    MetaActuate,
    /// Fires when the scheduler closes.
    MetaTerminate,
    /// Trap slot for task faults; not kernel-scheduled.
    MetaException,
    /// Exit of a target process.
    ProcessExit,
    /// Delivery of a POSIX signal.
    ProcessSignal,
    /// A monotonic interval timer.
    Time,
    /// Readiness to read from a descriptor.
    IoReceive,
    /// Readiness to write to a descriptor.
    IoTransmit,
    /// Status change on a descriptor.
    IoStatus,
    /// Any change to a filesystem path.
    FsStatus,
    /// Content growth or mutation of a filesystem path.
    FsDelta,
    /// Deletion or displacement of a filesystem path.
    FsVoid,
}

impl EventKind {
    /// Whether a fired registration stays scheduled unless overridden.
    pub fn cyclic_default(self) -> bool {
        matches!(
            self,
            EventKind::ProcessSignal
                | EventKind::Time
                | EventKind::IoReceive
                | EventKind::IoTransmit
                | EventKind::IoStatus
                | EventKind::FsStatus
                | EventKind::FsDelta
        )
    }

    /// Whether a `cyclic` override may be applied at all. Process exits
    /// and one-shot triggers cannot repeat.
    pub fn supports_cyclic(self) -> bool {
        !matches!(
            self,
            EventKind::ProcessExit | EventKind::MetaActuate | EventKind::MetaException
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Never => "never",
            EventKind::MetaActuate => "meta_actuate",
            EventKind::MetaTerminate => "meta_terminate",
            EventKind::MetaException => "meta_exception",
            EventKind::ProcessExit => "process_exit",
            EventKind::ProcessSignal => "process_signal",
            EventKind::Time => "time",
            EventKind::IoReceive => "io_receive",
            EventKind::IoTransmit => "io_transmit",
            EventKind::IoStatus => "io_status",
            EventKind::FsStatus => "fs_status",
            EventKind::FsDelta => "fs_delta",
            EventKind::FsVoid => "fs_void",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<EventKind> {
        Ok(match name {
            "never" => EventKind::Never,
            "meta_actuate" => EventKind::MetaActuate,
            "meta_terminate" => EventKind::MetaTerminate,
            "meta_exception" => EventKind::MetaException,
            "process_exit" => EventKind::ProcessExit,
            "process_signal" => EventKind::ProcessSignal,
            "time" => EventKind::Time,
            "io_receive" => EventKind::IoReceive,
            "io_transmit" => EventKind::IoTransmit,
            "io_status" => EventKind::IoStatus,
            "fs_status" => EventKind::FsStatus,
            "fs_delta" => EventKind::FsDelta,
            "fs_void" => EventKind::FsVoid,
            _ => return Err(Error::InvalidArgument("unrecognized event kind")),
        })
    }
}

enum Param {
    None,
    Process { pid: libc::pid_t },
    Signal { signo: i32 },
    Time { period: Duration },
    Io { port: RawFd, correlation: Option<RawFd> },
    Fs { path: PathBuf },
}

struct Inner {
    kind: EventKind,
    resource: Option<OwnedFd>,
    source: Option<Source>,
    param: Param,
    // Per-instance nonce: identity for timers and meta events, and the
    // kqueue ident for filters without a descriptor.
    token: u64,
}

fn next_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// An immutable value identifying a point of interest to the scheduler.
///
/// Handles are cheap to clone and share one kernel resource; the owned
/// descriptor closes when the last handle drops. [`Event::try_clone`]
/// produces an independent copy with a duplicated descriptor.
#[derive(Clone)]
pub struct Event(Arc<Inner>);

impl Event {
    fn build(kind: EventKind, resource: Option<OwnedFd>, source: Option<Source>, param: Param) -> Event {
        Event(Arc::new(Inner {
            kind,
            resource,
            source,
            param,
            token: next_token(),
        }))
    }

    /// A placeholder that never fires.
    pub fn never() -> Result<Event> {
        let resource = sys::open_user(false)?;
        Ok(Self::build(EventKind::Never, resource, None, Param::None))
    }

    /// A one-shot trigger, already armed: it fires on the first wait
    /// after dispatch.
    pub fn meta_actuate() -> Result<Event> {
        let resource = sys::open_user(true)?;
        Ok(Self::build(EventKind::MetaActuate, resource, None, Param::None))
    }

    /// Fires when the scheduler closes.
    pub fn meta_terminate() -> Result<Event> {
        let resource = sys::open_user(false)?;
        Ok(Self::build(EventKind::MetaTerminate, resource, None, Param::None))
    }

    /// The trap slot for task faults. Carries no kernel resource.
    pub fn meta_exception() -> Event {
        Self::build(EventKind::MetaException, None, None, Param::None)
    }

    /// A monotonic timer firing every `period`.
    pub fn time(period: Duration) -> Result<Event> {
        if period.is_zero() {
            return Err(Error::InvalidArgument("timer period must be non-zero"));
        }
        let resource = sys::open_timer(period)?;
        Ok(Self::build(EventKind::Time, resource, None, Param::Time { period }))
    }

    /// Exit of the process `pid`. A pre-opened process descriptor may be
    /// supplied as `port`; otherwise one is opened where the platform
    /// provides it.
    pub fn process_exit(pid: libc::pid_t, port: Option<OwnedFd>) -> Result<Event> {
        let resource = sys::open_process(pid, port)?;
        Ok(Self::build(
            EventKind::ProcessExit,
            resource,
            None,
            Param::Process { pid },
        ))
    }

    /// Delivery of `signo`. On signalfd systems the signal is blocked in
    /// the calling thread first; a pre-opened descriptor may be supplied
    /// as `port`.
    pub fn process_signal(signo: i32, port: Option<OwnedFd>) -> Result<Event> {
        let resource = sys::open_signal(signo, port)?;
        Ok(Self::build(
            EventKind::ProcessSignal,
            resource,
            None,
            Param::Signal { signo },
        ))
    }

    /// Readiness to read from `port`. The descriptor pair is supplied by
    /// the caller and stays caller-owned.
    pub fn io_receive(source: Option<Source>, port: RawFd, correlation: Option<RawFd>) -> Event {
        Self::build(
            EventKind::IoReceive,
            None,
            source,
            Param::Io { port, correlation },
        )
    }

    /// Readiness to write to `port`.
    pub fn io_transmit(source: Option<Source>, port: RawFd, correlation: Option<RawFd>) -> Event {
        Self::build(
            EventKind::IoTransmit,
            None,
            source,
            Param::Io { port, correlation },
        )
    }

    /// Status change on `port`.
    pub fn io_status(source: Option<Source>, port: RawFd, correlation: Option<RawFd>) -> Event {
        Self::build(
            EventKind::IoStatus,
            None,
            source,
            Param::Io { port, correlation },
        )
    }

    /// Any change to `path`.
    pub fn fs_status(path: impl Into<PathBuf>, port: Option<OwnedFd>) -> Result<Event> {
        Self::fs(EventKind::FsStatus, path.into(), port)
    }

    /// Content mutation of `path`.
    pub fn fs_delta(path: impl Into<PathBuf>, port: Option<OwnedFd>) -> Result<Event> {
        Self::fs(EventKind::FsDelta, path.into(), port)
    }

    /// Deletion or displacement of `path`.
    pub fn fs_void(path: impl Into<PathBuf>, port: Option<OwnedFd>) -> Result<Event> {
        Self::fs(EventKind::FsVoid, path.into(), port)
    }

    fn fs(kind: EventKind, path: PathBuf, port: Option<OwnedFd>) -> Result<Event> {
        let resource = sys::open_fs(kind, &path, port)?;
        Ok(Self::build(kind, resource, None, Param::Fs { path }))
    }

    /// An independent copy; any owned descriptor is duplicated with
    /// `dup`. Copies of timers and meta events keep the original's
    /// identity.
    pub fn try_clone(&self) -> Result<Event> {
        let resource = match &self.0.resource {
            Some(fd) => Some(syscall::dup_cloexec(fd.as_fd())?),
            None => None,
        };
        let param = match &self.0.param {
            Param::None => Param::None,
            Param::Process { pid } => Param::Process { pid: *pid },
            Param::Signal { signo } => Param::Signal { signo: *signo },
            Param::Time { period } => Param::Time { period: *period },
            Param::Io { port, correlation } => Param::Io {
                port: *port,
                correlation: *correlation,
            },
            Param::Fs { path } => Param::Fs { path: path.clone() },
        };
        Ok(Event(Arc::new(Inner {
            kind: self.0.kind,
            resource,
            source: self.0.source.clone(),
            param,
            token: self.0.token,
        })))
    }

    pub fn kind(&self) -> EventKind {
        self.0.kind
    }

    /// The watched descriptor: the owned kernel resource, the caller's
    /// read-side for io events, or `-1`.
    pub fn port(&self) -> RawFd {
        if let Some(fd) = &self.0.resource {
            return fd.as_raw_fd();
        }
        match self.0.param {
            Param::Io { port, .. } => port,
            _ => -1,
        }
    }

    /// The owned kernel resource, if any.
    pub fn resource(&self) -> Option<BorrowedFd<'_>> {
        self.0.resource.as_ref().map(|fd| fd.as_fd())
    }

    pub fn source(&self) -> Option<&Source> {
        self.0.source.as_ref()
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        match self.0.param {
            Param::Process { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn signo(&self) -> Option<i32> {
        match self.0.param {
            Param::Signal { signo } => Some(signo),
            _ => None,
        }
    }

    pub fn period(&self) -> Option<Duration> {
        match self.0.param {
            Param::Time { period } => Some(period),
            _ => None,
        }
    }

    pub fn correlation(&self) -> Option<RawFd> {
        match self.0.param {
            Param::Io { correlation, .. } => correlation,
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.0.param {
            Param::Fs { path } => Some(path),
            _ => None,
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.0.token
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        if self.0.kind != other.0.kind {
            return false;
        }
        match (&self.0.param, &other.0.param) {
            // Timers and meta events compare identity only.
            (Param::Time { .. }, Param::Time { .. }) | (Param::None, Param::None) => {
                self.0.token == other.0.token
            }
            _ => match (&self.0.resource, &other.0.resource) {
                (Some(a), Some(b)) => a.as_raw_fd() == b.as_raw_fd(),
                _ => match (&self.0.param, &other.0.param) {
                    (Param::Process { pid: a }, Param::Process { pid: b }) => a == b,
                    (Param::Signal { signo: a }, Param::Signal { signo: b }) => a == b,
                    (Param::Io { port: a, .. }, Param::Io { port: b, .. }) => a == b,
                    (Param::Fs { path: a }, Param::Fs { path: b }) => a == b,
                    _ => false,
                },
            },
        }
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.kind.hash(state);
        // Never the descriptor: an event with an owned resource must hash
        // like a structurally equal one without.
        match &self.0.param {
            Param::None | Param::Time { .. } => self.0.token.hash(state),
            Param::Process { pid } => pid.hash(state),
            Param::Signal { signo } => signo.hash(state),
            Param::Io { port, .. } => port.hash(state),
            Param::Fs { path } => path.hash(state),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Event");
        d.field("kind", &self.0.kind).field("port", &self.port());
        match &self.0.param {
            Param::Process { pid } => d.field("pid", pid),
            Param::Signal { signo } => d.field("signo", signo),
            Param::Time { period } => d.field("period", period),
            Param::Io { correlation, .. } => d.field("correlation", correlation),
            Param::Fs { path } => d.field("path", path),
            Param::None => &mut d,
        };
        d.finish()
    }
}
