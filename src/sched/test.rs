use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::{Scheduler, Timeout};
use crate::error::Error;
use crate::event::Event;
use crate::link::{Activation, Link};

fn counter_link(event: Event) -> (Link, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let link = Link::new(event, move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (link, count)
}

/// Waits and executes until at least one task ran, bounded by `rounds`.
fn pump(sched: &mut Scheduler, rounds: usize) -> usize {
    for _ in 0..rounds {
        sched.wait(Duration::from_secs(1)).unwrap();
        let ran = sched.execute();
        if ran > 0 {
            return ran;
        }
    }
    0
}

#[test]
fn test_timer_fires_once_and_stops() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::time(Duration::from_millis(10)).unwrap());
    let link = sched.dispatch(link, Some(false)).unwrap();

    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!sched.operations().contains(&link));

    // Nothing further fires once the registration is retired.
    sched.wait(Timeout::Hint(Duration::from_millis(50))).unwrap();
    sched.execute();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_recurring_timer_fires_repeatedly() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::time(Duration::from_millis(10)).unwrap());
    let link = sched.dispatch(link, Some(true)).unwrap();

    for _ in 0..3 {
        assert!(pump(&mut sched, 8) > 0);
    }
    assert!(count.load(Ordering::SeqCst) >= 3);
    assert!(sched.operations().contains(&link));
}

#[test]
fn test_cross_thread_enqueue_wakes_blocking_wait() {
    let mut sched = Scheduler::new().unwrap();
    let handle = sched.handle();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let submitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.enqueue(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    });

    let started = Instant::now();
    let fired = sched.wait(Duration::from_secs(3600)).unwrap();
    assert_eq!(fired, 0);
    assert!(started.elapsed() < Duration::from_secs(60));

    assert_eq!(sched.execute(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    submitter.join().unwrap();
}

#[test]
fn test_replace_dispatch_runs_only_the_replacement() {
    let mut sched = Scheduler::new().unwrap();
    let event = Event::time(Duration::from_millis(10)).unwrap();
    let (first, first_count) = counter_link(event.clone());
    let (second, second_count) = counter_link(event);

    sched.dispatch(first.clone(), Some(false)).unwrap();
    sched.dispatch(second, Some(false)).unwrap();
    assert!(first.cancelled());

    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_process_exit_is_inherently_one_shot() {
    let mut sched = Scheduler::new().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as libc::pid_t;

    let (link, count) = counter_link(Event::process_exit(pid, None).unwrap());
    let link = sched.dispatch(link, None).unwrap();

    let (rejected, _) = counter_link(Event::process_exit(pid, None).unwrap());
    assert!(matches!(
        sched.dispatch(rejected, Some(true)),
        Err(Error::InvalidArgument(_))
    ));

    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!sched.operations().contains(&link));
    child.wait().unwrap();
}

#[test]
fn test_trap_captures_task_fault_and_execution_continues() {
    let mut sched = Scheduler::new().unwrap();

    let faults = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&faults);
    let trap = Link::new(Event::meta_exception(), move |_, activation| {
        if let Activation::Fault(fault) = activation {
            observed.lock().unwrap().push(fault.message().to_string());
        }
    });
    sched.dispatch(trap, None).unwrap();

    let after = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&after);
    sched.enqueue(|| panic!("boom"));
    sched.enqueue(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(sched.execute(), 2);
    assert_eq!(*faults.lock().unwrap(), vec!["boom".to_string()]);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancelling_exception_event_clears_trap() {
    let mut sched = Scheduler::new().unwrap();
    let trap = Link::new(Event::meta_exception(), |_, _| {});
    let trap = sched.dispatch(trap, None).unwrap();
    assert!(trap.dispatched());

    sched.cancel(&trap).unwrap();
    assert!(trap.cancelled());
}

#[test]
fn test_close_enqueues_terminate_links_once() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::meta_terminate().unwrap());
    sched.dispatch(link, None).unwrap();

    assert!(sched.close());
    assert!(sched.closed());
    assert_eq!(sched.execute(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Idempotent: the second close releases nothing and delivers nothing.
    assert!(!sched.close());
    assert_eq!(sched.execute(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // A closed scheduler no longer blocks.
    assert_eq!(sched.wait(Duration::from_secs(3600)).unwrap(), 0);
}

#[test]
fn test_interrupt_bounds_a_blocking_wait() {
    let mut sched = Scheduler::new().unwrap();
    let handle = sched.handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.interrupt().unwrap()
    });

    let started = Instant::now();
    assert_eq!(sched.wait(Duration::from_secs(3600)).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(interrupter.join().unwrap());
}

#[test]
fn test_indefinite_wait_ends_on_interrupt() {
    let mut sched = Scheduler::new().unwrap();
    let handle = sched.handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.interrupt().unwrap()
    });

    assert_eq!(sched.wait(Timeout::Indefinite).unwrap(), 0);
    assert!(interrupter.join().unwrap());
}

#[test]
fn test_indefinite_wait_returns_on_event() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::time(Duration::from_millis(10)).unwrap());
    sched.dispatch(link, Some(false)).unwrap();

    assert_eq!(sched.wait(Timeout::Indefinite).unwrap(), 1);
    sched.execute();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interrupt_without_blocked_wait_reports_false() {
    let sched = Scheduler::new().unwrap();
    assert!(!sched.interrupt().unwrap());
}

#[test]
fn test_actuation_fires_once_and_cannot_repeat() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::meta_actuate().unwrap());
    sched.dispatch(link, None).unwrap();

    let (again, _) = counter_link(Event::meta_actuate().unwrap());
    assert!(matches!(
        sched.dispatch(again, None),
        Err(Error::InvalidArgument(_))
    ));

    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(sched.operations().is_empty());
}

#[test]
fn test_dispatch_cancel_round_trips_to_pristine() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::time(Duration::from_millis(10)).unwrap());
    let link = sched.dispatch(link, Some(false)).unwrap();

    sched.cancel(&link).unwrap();
    assert!(sched.operations().is_empty());

    sched.wait(Timeout::Hint(Duration::from_millis(50))).unwrap();
    sched.execute();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_loaded_task_queue_forces_poll() {
    let mut sched = Scheduler::new().unwrap();
    sched.enqueue(|| {});

    // A loaded queue must not block, whatever the timeout says.
    let started = Instant::now();
    sched.wait(Duration::from_secs(3600)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(sched.execute(), 1);
}

#[test]
fn test_owner_enqueues_are_observed_in_order() {
    let mut sched = Scheduler::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..10 {
        let order = Arc::clone(&order);
        sched.enqueue(move || order.lock().unwrap().push(n));
    }
    assert_eq!(sched.execute(), 10);
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_void_drops_everything_without_terminate_delivery() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::meta_terminate().unwrap());
    sched.dispatch(link, None).unwrap();
    sched.enqueue(|| {});

    sched.void();
    assert!(sched.closed());
    assert!(sched.operations().is_empty());
    assert_eq!(sched.execute(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_io_receive_fires_on_readable_stream() {
    let mut sched = Scheduler::new().unwrap();
    let (reader, mut writer) = UnixStream::pair().unwrap();

    let (link, count) = counter_link(Event::io_receive(None, reader.as_raw_fd(), None));
    sched.dispatch(link, Some(false)).unwrap();

    writer.write_all(b"ping").unwrap();
    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(reader);
}

#[test]
fn test_fs_delta_fires_on_write() {
    let path = std::env::temp_dir().join(format!("delta-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"seed").unwrap();

    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::fs_delta(&path, None).unwrap());
    sched.dispatch(link, Some(false)).unwrap();

    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"more")
        .unwrap();

    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    std::fs::remove_file(&path).unwrap();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn test_process_signal_fires_on_raise() {
    let mut sched = Scheduler::new().unwrap();
    let (link, count) = counter_link(Event::process_signal(libc::SIGUSR1, None).unwrap());
    sched.dispatch(link, Some(false)).unwrap();

    unsafe { libc::raise(libc::SIGUSR1) };
    assert_eq!(pump(&mut sched, 8), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
