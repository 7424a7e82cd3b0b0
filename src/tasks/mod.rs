#[cfg(test)]
mod test;

use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use crate::link::{Fault, Link};

/// Segment growth ceiling.
pub(crate) const MAX_TASKS_PER_SEGMENT: usize = 128;
const INITIAL_SEGMENT: usize = 8;

/// A unit of deferred work.
pub(crate) enum Task {
    /// A host-submitted callable, run once with no arguments.
    Call(Box<dyn FnOnce() + Send>),
    /// A scheduled link whose event fired.
    Link(Link),
}

/// Two-chain segmented FIFO.
///
/// `loading` is appended tail-first (possibly from foreign threads, under
/// the scheduler's critical section); `executing` is drained head-first
/// by the owner. Segment capacity doubles up to
/// [`MAX_TASKS_PER_SEGMENT`] as the tail fills.
pub(crate) struct TaskQueue {
    executing: VecDeque<Vec<Task>>,
    loading: VecDeque<Vec<Task>>,
    cap: usize,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        let mut loading = VecDeque::new();
        loading.push_back(Vec::with_capacity(INITIAL_SEGMENT));
        TaskQueue {
            executing: VecDeque::new(),
            loading,
            cap: INITIAL_SEGMENT,
        }
    }

    pub fn enqueue(&mut self, task: Task) {
        let full = self
            .loading
            .back()
            .map_or(true, |seg| seg.len() == seg.capacity());
        if full {
            self.extend();
        }
        if let Some(tail) = self.loading.back_mut() {
            tail.push(task);
        }
    }

    fn extend(&mut self) {
        self.cap = (self.cap * 2).min(MAX_TASKS_PER_SEGMENT);
        self.loading.push_back(Vec::with_capacity(self.cap));
    }

    /// Takes the next batch to run: the executing chain, or the loading
    /// chain rotated in if executing is already drained. A fresh loading
    /// head is installed on rotation; the rotated segments' lengths
    /// record their exact occupancy.
    pub fn cycle_out(&mut self) -> Option<VecDeque<Vec<Task>>> {
        if self.executing.iter().all(|seg| seg.is_empty()) {
            if self.loading.iter().all(|seg| seg.is_empty()) {
                return None;
            }
            self.executing = mem::take(&mut self.loading);
            self.loading.push_back(Vec::with_capacity(INITIAL_SEGMENT));
            self.cap = INITIAL_SEGMENT;
        }
        Some(mem::take(&mut self.executing))
    }

    /// Whether any task is queued in either chain.
    pub fn loaded(&self) -> bool {
        self.executing.iter().any(|seg| !seg.is_empty())
            || self.loading.iter().any(|seg| !seg.is_empty())
    }
}

/// Runs one task, diverting any fault to the trap link.
///
/// Faults never escape: a panicking task reaches the trap (or the log),
/// and a panicking trap downgrades to a warning.
pub(crate) fn run(task: Task, trap: Option<&Link>) {
    match task {
        Task::Call(f) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                deliver(trap, Fault {
                    link: None,
                    payload,
                });
            }
        }
        Task::Link(link) => {
            match panic::catch_unwind(AssertUnwindSafe(|| link.invoke())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("link skipped: {e}"),
                Err(payload) => deliver(trap, Fault {
                    link: Some(link),
                    payload,
                }),
            }
        }
    }
}

fn deliver(trap: Option<&Link>, fault: Fault) {
    match trap {
        Some(t) => match panic::catch_unwind(AssertUnwindSafe(|| t.invoke_fault(&fault))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("unraisable: trap rejected fault: {e}"),
            Err(_) => log::warn!("unraisable: trap faulted on {:?}", fault),
        },
        None => log::error!("task fault without trap: {}", fault.message()),
    }
}
