#[cfg(test)]
mod test;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::event::{Event, Source};

const CANCELLED: u8 = 1 << 0;
const DISPATCHED: u8 = 1 << 1;
const EXECUTING: u8 = 1 << 2;
const CYCLIC: u8 = 1 << 3;

/// Why a link's task is being invoked.
pub enum Activation<'a> {
    /// The link's event fired, or the link was run directly.
    Fired,
    /// The link is the trap slot and another task faulted.
    Fault(&'a Fault),
}

/// A task fault delivered to the trap link.
pub struct Fault {
    /// The failing link, when the task was a scheduled one.
    pub link: Option<Link>,
    /// The panic payload.
    pub payload: Box<dyn Any + Send>,
}

impl Fault {
    /// The payload as text, when the task failed with a string message.
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s
        } else {
            "task fault"
        }
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("link", &self.link)
            .field("message", &self.message())
            .finish()
    }
}

type TaskFn = dyn Fn(&Link, Activation<'_>) + Send + Sync;

struct Inner {
    event: Event,
    task: Box<TaskFn>,
    context: Option<Source>,
    flags: AtomicU8,
    token: u64,
}

fn next_token() -> u64 {
    // 0 is reserved for the interrupt channel.
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A scheduled-event binding: an [`Event`] joined with the task to run
/// when it fires, plus an optional context object.
///
/// Handles are cheap to clone; equality and hashing are by identity.
#[derive(Clone)]
pub struct Link(Arc<Inner>);

impl Link {
    pub fn new(
        event: Event,
        task: impl Fn(&Link, Activation<'_>) + Send + Sync + 'static,
    ) -> Link {
        Self::build(event, Box::new(task), None)
    }

    pub fn with_context(
        event: Event,
        task: impl Fn(&Link, Activation<'_>) + Send + Sync + 'static,
        context: Source,
    ) -> Link {
        Self::build(event, Box::new(task), Some(context))
    }

    fn build(event: Event, task: Box<TaskFn>, context: Option<Source>) -> Link {
        Link(Arc::new(Inner {
            event,
            task,
            context,
            flags: AtomicU8::new(0),
            token: next_token(),
        }))
    }

    pub fn event(&self) -> &Event {
        &self.0.event
    }

    pub fn task(&self) -> &(dyn Fn(&Link, Activation<'_>) + Send + Sync) {
        &*self.0.task
    }

    pub fn context(&self) -> Option<&Source> {
        self.0.context.as_ref()
    }

    /// Runs the task with this link as argument.
    ///
    /// Fails with [`Error::AlreadyExecuting`] if invoked re-entrantly,
    /// without running the task.
    pub fn invoke(&self) -> Result<()> {
        self.activate(Activation::Fired)
    }

    pub(crate) fn invoke_fault(&self, fault: &Fault) -> Result<()> {
        self.activate(Activation::Fault(fault))
    }

    fn activate(&self, activation: Activation<'_>) -> Result<()> {
        let prior = self.0.flags.fetch_or(EXECUTING, Ordering::AcqRel);
        if prior & EXECUTING != 0 {
            return Err(Error::AlreadyExecuting);
        }
        // Clears the flag even when the task unwinds.
        struct Guard<'a>(&'a AtomicU8);
        impl Drop for Guard<'_> {
            fn drop(&mut self) {
                self.0.fetch_and(!EXECUTING, Ordering::AcqRel);
            }
        }
        let _guard = Guard(&self.0.flags);
        (self.0.task)(self, activation);
        Ok(())
    }

    fn flag(&self, bit: u8) -> bool {
        self.0.flags.load(Ordering::Acquire) & bit != 0
    }

    fn set_flag(&self, bit: u8, on: bool) {
        if on {
            self.0.flags.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.0.flags.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// The registration was retired, displaced or explicitly cancelled.
    pub fn cancelled(&self) -> bool {
        self.flag(CANCELLED)
    }

    /// The link was handed to a scheduler.
    pub fn dispatched(&self) -> bool {
        self.flag(DISPATCHED)
    }

    /// The task is currently running.
    pub fn executing(&self) -> bool {
        self.flag(EXECUTING)
    }

    /// The registration stays scheduled after it fires.
    pub fn cyclic(&self) -> bool {
        self.flag(CYCLIC)
    }

    pub(crate) fn set_cancelled(&self, on: bool) {
        self.set_flag(CANCELLED, on);
    }

    pub(crate) fn set_dispatched(&self, on: bool) {
        self.set_flag(DISPATCHED, on);
    }

    pub(crate) fn set_cyclic(&self, on: bool) {
        self.set_flag(CYCLIC, on);
    }

    pub(crate) fn token(&self) -> u64 {
        self.0.token
    }

    pub(crate) fn downgrade(&self) -> WeakLink {
        WeakLink(Arc::downgrade(&self.0))
    }
}

// Lets cancellation address a registration by link or by event.
impl<'a> From<&'a Link> for &'a Event {
    fn from(link: &'a Link) -> &'a Event {
        link.event()
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Link {}

impl Hash for Link {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("event", self.event())
            .field("cancelled", &self.cancelled())
            .field("dispatched", &self.dispatched())
            .field("executing", &self.executing())
            .field("cyclic", &self.cyclic())
            .finish()
    }
}

/// Non-owning handle used to resolve kernel user-data back to a link.
///
/// Upgrades succeed only while the reference map, the cancellation
/// bucket or the task queue still hold the link alive.
pub(crate) struct WeakLink(Weak<Inner>);

impl WeakLink {
    pub fn upgrade(&self) -> Option<Link> {
        self.0.upgrade().map(Link)
    }

    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}
