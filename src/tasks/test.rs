use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{run, Task, TaskQueue};
use crate::event::Event;
use crate::link::{Activation, Link};

fn numbered(order: &Arc<Mutex<Vec<usize>>>, n: usize) -> Task {
    let order = Arc::clone(order);
    Task::Call(Box::new(move || order.lock().unwrap().push(n)))
}

fn drain(queue: &mut TaskQueue) -> usize {
    let mut total = 0;
    while let Some(segments) = queue.cycle_out() {
        for segment in segments {
            for task in segment {
                run(task, None);
                total += 1;
            }
        }
    }
    total
}

#[test]
fn test_fifo_across_segment_growth() {
    let mut queue = TaskQueue::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Enough to force several extensions past the growth ceiling.
    for n in 0..300 {
        queue.enqueue(numbered(&order, n));
    }
    assert_eq!(drain(&mut queue), 300);

    let order = order.lock().unwrap();
    assert_eq!(*order, (0..300).collect::<Vec<_>>());
}

#[test]
fn test_empty_queue_yields_nothing() {
    let mut queue = TaskQueue::new();
    assert!(!queue.loaded());
    assert!(queue.cycle_out().is_none());
}

#[test]
fn test_loaded_tracks_both_chains() {
    let mut queue = TaskQueue::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    queue.enqueue(numbered(&order, 0));
    assert!(queue.loaded());

    let batch = queue.cycle_out().unwrap();
    assert!(!queue.loaded());
    drop(batch);

    assert!(queue.cycle_out().is_none());
}

#[test]
fn test_work_enqueued_between_cycles_is_picked_up() {
    let mut queue = TaskQueue::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    queue.enqueue(numbered(&order, 0));
    let first = queue.cycle_out().unwrap();

    queue.enqueue(numbered(&order, 1));
    let second = queue.cycle_out().unwrap();

    for segment in first.into_iter().chain(second) {
        for task in segment {
            run(task, None);
        }
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1]);
}

#[test]
fn test_panicking_task_is_contained() {
    run(Task::Call(Box::new(|| panic!("boom"))), None);
}

#[test]
fn test_trap_receives_fault_from_callable() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let trap = Link::new(Event::meta_exception(), move |_, activation| {
        if let Activation::Fault(fault) = activation {
            observed.lock().unwrap().push(fault.message().to_string());
            assert!(fault.link.is_none());
        }
    });

    run(Task::Call(Box::new(|| panic!("boom"))), Some(&trap));
    assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string()]);
}

#[test]
fn test_trap_receives_failing_link() {
    let failing = Link::new(Event::meta_exception(), |_, _| panic!("task down"));

    let seen = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen);
    let expected = failing.clone();
    let trap = Link::new(Event::meta_exception(), move |_, activation| {
        if let Activation::Fault(fault) = activation {
            assert_eq!(fault.link.as_ref(), Some(&expected));
            observed.fetch_add(1, Ordering::SeqCst);
        }
    });

    run(Task::Link(failing), Some(&trap));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_trap_is_contained() {
    let trap = Link::new(Event::meta_exception(), |_, _| panic!("trap down"));
    run(Task::Call(Box::new(|| panic!("boom"))), Some(&trap));
}
