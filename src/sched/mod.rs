#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::link::Link;
use crate::queue::KernelQueue;
use crate::sys::Waker;
use crate::tasks::{self, Task, TaskQueue};

// `waiting` states.
const INITIAL: i32 = 2;
const UNBLOCKED: i32 = 0;
const BLOCKED: i32 = 1;
const INTERRUPTING: i32 = -1;
const CLOSED: i32 = -3;

/// Drain/cycle iterations per `execute` call.
const EXECUTE_CYCLES: usize = 3;

/// Scheduler configuration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Opts {
    /// Transparent-retry bound for `EINTR`/`ENOMEM` on control syscalls.
    pub retry_limit: u32,
}

impl Default for Opts {
    fn default() -> Opts {
        Opts { retry_limit: 16 }
    }
}

/// How long [`Scheduler::wait`] may block.
pub enum Timeout {
    /// Mark the scheduler blocked and wait until an event arrives or an
    /// [`interrupt`][Scheduler::interrupt] ends the wait.
    Indefinite,
    /// Mark the scheduler blocked and wait up to the duration; an
    /// [`interrupt`][Scheduler::interrupt] ends the wait early.
    Block(Duration),
    /// Collect whatever is pending without blocking.
    Poll,
    /// Sub-second poll without marking blocked; anything past one second
    /// is clipped.
    Hint(Duration),
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Timeout {
        Timeout::Block(duration)
    }
}

struct Shared {
    tasks: Mutex<TaskQueue>,
    waiting: AtomicI32,
    waker: Waker,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskQueue> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, task: Task) {
        self.lock().enqueue(task);
    }

    fn interrupt(&self) -> Result<bool> {
        let exchanged = self.waiting.compare_exchange(
            BLOCKED,
            INTERRUPTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if exchanged.is_ok() {
            self.waker.wake()?;
            Ok(true)
        } else {
            // Not blocked, or a wake is already pending.
            Ok(false)
        }
    }
}

/// Foreign-thread surface of a [`Scheduler`].
///
/// Only task submission and interrupts are safe off the owner thread;
/// every other operation stays on the scheduler itself.
#[derive(Clone)]
pub struct Handle(Arc<Shared>);

impl Handle {
    /// Appends a callable for the owner thread and wakes a blocking
    /// wait.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.0.enqueue(Task::Call(Box::new(task)));
        if let Err(e) = self.0.interrupt() {
            log::warn!("wake after enqueue failed: {e}");
        }
    }

    /// Wakes a blocking [`Scheduler::wait`]. Returns whether a wake was
    /// issued; `false` means none was needed or one is already pending.
    pub fn interrupt(&self) -> Result<bool> {
        self.0.interrupt()
    }
}

/// Single-threaded cooperative event scheduler.
///
/// Multiplexes kernel-reported events, host-submitted callables and a
/// small set of meta events into one FIFO pipeline: the owner thread
/// loops `wait` → `execute` while other threads submit work through a
/// [`Handle`].
pub struct Scheduler {
    kq: KernelQueue,
    shared: Arc<Shared>,
    trap: Option<Link>,
}

impl Scheduler {
    pub fn new() -> Result<Scheduler> {
        Self::with_opts(Opts::default())
    }

    pub fn with_opts(opts: Opts) -> Result<Scheduler> {
        let kq = KernelQueue::open(opts.retry_limit)?;
        let waker = kq.waker()?;
        let shared = Arc::new(Shared {
            tasks: Mutex::new(TaskQueue::new()),
            waiting: AtomicI32::new(INITIAL),
            waker,
        });
        Ok(Scheduler {
            kq,
            shared,
            trap: None,
        })
    }

    /// A cloneable handle for foreign threads.
    pub fn handle(&self) -> Handle {
        Handle(Arc::clone(&self.shared))
    }

    /// Schedules a link, routed by its event kind.
    ///
    /// `MetaException` links install the trap slot instead of touching
    /// the kernel; `MetaActuate` additionally moves the scheduler out of
    /// its initial state and fails if it already left it. `cyclic`
    /// overrides the kind's default when given.
    pub fn dispatch(&mut self, link: Link, cyclic: Option<bool>) -> Result<Link> {
        match link.event().kind() {
            EventKind::MetaException => {
                link.set_dispatched(true);
                self.trap = Some(link.clone());
                Ok(link)
            }
            EventKind::MetaActuate => {
                if self.kq.is_closed() {
                    return Err(Error::Closed);
                }
                let actuated = self.shared.waiting.compare_exchange(
                    INITIAL,
                    UNBLOCKED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if actuated.is_err() {
                    return Err(Error::InvalidArgument("scheduler already actuated"));
                }
                self.kq.schedule(&link, cyclic)?;
                Ok(link)
            }
            _ => {
                self.kq.schedule(&link, cyclic)?;
                Ok(link)
            }
        }
    }

    /// Retires a registration, addressed by event or by link. Cancelling
    /// a `MetaException` event clears the trap slot.
    pub fn cancel<'a>(&mut self, target: impl Into<&'a Event>) -> Result<()> {
        let event: &Event = target.into();
        if event.kind() == EventKind::MetaException {
            if let Some(trap) = self.trap.take() {
                trap.set_cancelled(true);
            }
            return Ok(());
        }
        self.kq.cancel(event)
    }

    /// Appends a callable for the next `execute` and wakes a blocking
    /// wait. Also available off-thread through [`Handle::enqueue`].
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.enqueue(Task::Call(Box::new(task)));
        if let Err(e) = self.shared.interrupt() {
            log::warn!("wake after enqueue failed: {e}");
        }
    }

    /// Drains the task queue, rotating in concurrently enqueued work up
    /// to a bounded number of cycles. Returns the number of tasks run.
    ///
    /// Task faults are diverted to the trap link and never escape.
    pub fn execute(&mut self) -> usize {
        let trap = self.trap.clone();
        let mut total = 0;
        for _ in 0..EXECUTE_CYCLES {
            // Segments are taken out under the lock and run outside it,
            // so tasks may re-enqueue freely.
            let Some(segments) = self.shared.lock().cycle_out() else {
                break;
            };
            for segment in segments {
                for task in segment {
                    tasks::run(task, trap.as_ref());
                    total += 1;
                }
            }
        }
        total
    }

    /// Blocks until events arrive, translates them into queued tasks and
    /// returns how many links fired.
    ///
    /// Returns zero immediately when the kernel queue is closed; a
    /// loaded task queue forces a non-blocking poll regardless of the
    /// requested timeout.
    pub fn wait(&mut self, timeout: impl Into<Timeout>) -> Result<usize> {
        if self.kq.is_closed() {
            return Ok(0);
        }
        let timeout = if self.loaded() {
            Timeout::Poll
        } else {
            timeout.into()
        };
        let (deadline, block) = match timeout {
            Timeout::Indefinite => (None, true),
            Timeout::Poll => (Some((0, 0)), false),
            Timeout::Hint(duration) => {
                let nanos = duration.as_nanos().min(999_999_999) as u32;
                (Some((0, nanos)), false)
            }
            Timeout::Block(duration) => {
                (Some((duration.as_secs(), duration.subsec_nanos())), true)
            }
        };

        if block {
            self.shared.waiting.store(BLOCKED, Ordering::Release);
        }
        let received = self.kq.receive(deadline);
        if block {
            // Unconditional: also clears a pending-interrupt mark.
            self.shared.waiting.store(UNBLOCKED, Ordering::Release);
        }
        received?;

        let fired = self.kq.transition();
        let count = fired.len();
        if count > 0 {
            let mut queue = self.shared.lock();
            for link in fired {
                queue.enqueue(Task::Link(link));
            }
        }
        Ok(count)
    }

    /// Wakes a blocking [`wait`][Scheduler::wait] from any thread.
    pub fn interrupt(&self) -> Result<bool> {
        self.shared.interrupt()
    }

    /// Enqueues every scheduled terminate link and closes the kernel
    /// descriptors. Returns `false` when already closed.
    ///
    /// The terminate tasks run on the next `execute`; each fires at most
    /// once because the links are transferred out of the reference map.
    pub fn close(&mut self) -> bool {
        if self.shared.waiting.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return false;
        }
        let terminate = self.kq.take_terminate();
        if !terminate.is_empty() {
            let mut queue = self.shared.lock();
            for link in terminate {
                queue.enqueue(Task::Link(link));
            }
        }
        self.kq.close();
        true
    }

    /// Closes without terminate delivery and drops every reference.
    pub fn void(&mut self) {
        self.shared.waiting.store(CLOSED, Ordering::Release);
        self.kq.void();
        self.trap = None;
        *self.shared.lock() = TaskQueue::new();
    }

    /// Snapshot of the currently-scheduled links.
    pub fn operations(&self) -> Vec<Link> {
        self.kq.operations()
    }

    pub fn closed(&self) -> bool {
        self.kq.is_closed() || self.shared.waiting.load(Ordering::Acquire) == CLOSED
    }

    /// Whether any task is queued for execution.
    pub fn loaded(&self) -> bool {
        self.shared.lock().loaded()
    }
}
