
use std::collections::HashMap;
use std::io;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::link::{Link, WeakLink};
use crate::sys::{Events, Selector, Waker, WAKE_TOKEN};

/// Thin stateful layer over the platform selector.
///
/// `references` is the sole strong holder keeping a dispatched link
/// alive; `cancellations` holds displaced links whose kernel records may
/// still be in flight, released only after the next collection pass.
pub(crate) struct KernelQueue {
    sys: Option<Selector>,
    references: HashMap<Event, Link>,
    cancellations: Vec<Link>,
    tokens: HashMap<u64, WeakLink>,
    collected: Events,
    retry_limit: u32,
}

fn retried<T>(limit: u32, mut f: impl FnMut() -> io::Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match f() {
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EINTR) | Some(libc::ENOMEM)
                ) && attempts < limit =>
            {
                attempts += 1;
            }
            Err(e) => {
                return Err(match e.raw_os_error() {
                    // The retry budget is spent or the condition is not
                    // transient: surface exhaustion as such.
                    Some(libc::ENOMEM) => Error::Exhausted("kernel memory"),
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        Error::Exhausted("descriptor table full")
                    }
                    _ => Error::Kernel(e),
                })
            }
            Ok(value) => return Ok(value),
        }
    }
}

impl KernelQueue {
    pub fn open(retry_limit: u32) -> Result<KernelQueue> {
        let sys = Selector::new()?;
        Ok(KernelQueue {
            sys: Some(sys),
            references: HashMap::new(),
            cancellations: Vec::new(),
            tokens: HashMap::new(),
            collected: Events::new(),
            retry_limit,
        })
    }

    pub fn waker(&self) -> Result<Waker> {
        let sys = self.sys.as_ref().ok_or(Error::Closed)?;
        Ok(sys.waker()?)
    }

    pub fn is_closed(&self) -> bool {
        self.sys.is_none()
    }

    /// Registers the link's event, displacing any previous registration
    /// for an equal event into the cancellation bucket.
    pub fn schedule(&mut self, link: &Link, cyclic: Option<bool>) -> Result<()> {
        let sys = self.sys.as_ref().ok_or(Error::Closed)?;
        let event = link.event().clone();
        let kind = event.kind();

        let cyclic = cyclic.unwrap_or_else(|| kind.cyclic_default());
        if cyclic && !kind.supports_cyclic() {
            return Err(Error::InvalidArgument("event kind cannot repeat"));
        }
        link.set_cyclic(cyclic);

        let prior = self.references.insert(event.clone(), link.clone());
        // Re-dispatching the same link is a registration refresh, not a
        // displacement.
        let displaced = matches!(&prior, Some(p) if p != link);
        if displaced {
            if let Some(prior) = &prior {
                prior.set_cancelled(true);
                self.cancellations.push(prior.clone());
            }
        }

        match retried(self.retry_limit, || sys.register(&event, link.token(), cyclic)) {
            Ok(()) => {
                self.tokens.insert(link.token(), link.downgrade());
                link.set_dispatched(true);
                Ok(())
            }
            Err(e) => {
                // Revert the displacement.
                match prior {
                    Some(prior) => {
                        if displaced {
                            self.cancellations.pop();
                            prior.set_cancelled(false);
                        }
                        self.references.insert(event, prior);
                    }
                    None => {
                        self.references.remove(&event);
                    }
                }
                Err(e)
            }
        }
    }

    /// Retires the registration for `event`. Absent registrations
    /// succeed as a no-op.
    pub fn cancel(&mut self, event: &Event) -> Result<()> {
        let Some(link) = self.references.get(event).cloned() else {
            return Ok(());
        };

        // Bucket insert precedes the kernel delete: a record collected in
        // this window must still resolve to a live link.
        self.cancellations.push(link.clone());
        self.references.remove(event);
        link.set_cancelled(true);

        let Some(sys) = self.sys.as_ref() else {
            return Ok(());
        };
        match retried(self.retry_limit, || sys.deregister(event)) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("cancel failed for {:?}: {}", event, e);
                self.cancellations.pop();
                link.set_cancelled(false);
                self.references.insert(event.clone(), link);
                Err(e)
            }
        }
    }

    /// Blocks until an event arrives, the `(seconds, nanoseconds)`
    /// timeout elapses, or a wake is issued; `None` blocks indefinitely.
    ///
    /// `EINTR` yields zero events (the caller loops); `EBADF` means the
    /// descriptor went away under us and closes the queue silently.
    pub fn receive(&mut self, timeout: Option<(u64, u32)>) -> Result<usize> {
        let Some(sys) = self.sys.as_ref() else {
            return Ok(0);
        };
        match sys.wait(&mut self.collected, timeout) {
            Ok(count) => Ok(count),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                self.collected.clear();
                Ok(0)
            }
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                self.collected.clear();
                self.close();
                Ok(0)
            }
            Err(e) => Err(Error::Kernel(e)),
        }
    }

    /// Walks the freshly collected records and returns the links to
    /// append to the task queue, retiring non-cyclic registrations.
    pub fn transition(&mut self) -> Vec<Link> {
        let mut fired = Vec::with_capacity(self.collected.len());
        let tokens: Vec<u64> = self.collected.tokens().collect();
        self.collected.clear();

        for token in tokens {
            if token == WAKE_TOKEN {
                if let Some(sys) = self.sys.as_ref() {
                    sys.acknowledge_wake();
                }
                continue;
            }
            // A failed upgrade is a stale record for a link that nothing
            // holds anymore.
            let Some(link) = self.tokens.get(&token).and_then(WeakLink::upgrade) else {
                continue;
            };

            if link.cyclic() {
                if let Some(sys) = self.sys.as_ref() {
                    sys.drain(link.event());
                }
            } else {
                // Only touch the map when this link still owns the
                // registration; an in-flight record for a displaced link
                // must not evict its replacement.
                if self.references.get(link.event()) == Some(&link) {
                    if Selector::ONESHOT_PERSISTS {
                        if let Some(sys) = self.sys.as_ref() {
                            let _ = sys.deregister(link.event());
                        }
                    }
                    self.references.remove(link.event());
                }
                link.set_cancelled(true);
                self.tokens.remove(&token);
            }
            fired.push(link);
        }

        // References held solely to survive this window drop now.
        self.cancellations.clear();
        self.tokens.retain(|_, weak| !weak.is_dead());
        fired
    }

    /// Transfers every scheduled terminate link out of the map.
    pub fn take_terminate(&mut self) -> Vec<Link> {
        let events: Vec<Event> = self
            .references
            .keys()
            .filter(|event| event.kind() == EventKind::MetaTerminate)
            .cloned()
            .collect();
        events
            .into_iter()
            .filter_map(|event| self.references.remove(&event))
            .collect()
    }

    /// Snapshot of the currently-scheduled links.
    pub fn operations(&self) -> Vec<Link> {
        self.references.values().cloned().collect()
    }

    /// Closes the kernel descriptors; idempotent. Registrations stay in
    /// the map but can no longer fire.
    pub fn close(&mut self) -> bool {
        match self.sys.take() {
            Some(_) => {
                log::trace!("kernel queue closed");
                true
            }
            None => false,
        }
    }

    /// Close and drop every reference, without terminate delivery.
    pub fn void(&mut self) {
        self.references.clear();
        self.cancellations.clear();
        self.tokens.clear();
        self.collected.clear();
        self.close();
    }

    #[cfg(test)]
    pub fn pending_cancellations(&self) -> usize {
        self.cancellations.len()
    }
}
