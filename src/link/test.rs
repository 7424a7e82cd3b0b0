use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Activation, Link};
use crate::error::Error;
use crate::event::{Event, Source};

#[test]
fn test_flags_start_clear() {
    let link = Link::new(Event::meta_exception(), |_, _| {});
    assert!(!link.cancelled());
    assert!(!link.dispatched());
    assert!(!link.executing());
    assert!(!link.cyclic());
}

#[test]
fn test_invoke_runs_task_with_link_argument() {
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ran);
    let link = Link::new(Event::meta_exception(), move |link, _| {
        assert!(link.executing());
        seen.fetch_add(1, Ordering::SeqCst);
    });

    link.invoke().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!link.executing());
}

#[test]
fn test_reentrant_invoke_fails_without_running_task() {
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ran);
    let link = Link::new(Event::meta_exception(), move |link, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert!(matches!(link.invoke(), Err(Error::AlreadyExecuting)));
    });

    link.invoke().unwrap();
    // The re-entrant call above must not have run the task again.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_executing_clears_after_panic() {
    let link = Link::new(Event::meta_exception(), |_, _| panic!("boom"));
    let result = panic::catch_unwind(AssertUnwindSafe(|| link.invoke()));
    assert!(result.is_err());
    assert!(!link.executing());
}

#[test]
fn test_identity_equality() {
    let event = Event::meta_exception();
    let a = Link::new(event.clone(), |_, _| {});
    let b = Link::new(event, |_, _| {});
    assert_eq!(a, a.clone());
    assert_ne!(a, b);
}

#[test]
fn test_context_retained() {
    let context: Source = Arc::new("ctx".to_string());
    let link = Link::with_context(Event::meta_exception(), |_, _| {}, context);
    let held = link.context().unwrap();
    assert_eq!(held.downcast_ref::<String>().map(String::as_str), Some("ctx"));
}

#[test]
fn test_fault_activation_carries_payload() {
    let seen = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&seen);
    let trap = Link::new(Event::meta_exception(), move |_, activation| {
        if let Activation::Fault(fault) = activation {
            assert_eq!(fault.message(), "went wrong");
            observed.fetch_add(1, Ordering::SeqCst);
        }
    });

    let fault = super::Fault {
        link: None,
        payload: Box::new("went wrong".to_string()),
    };
    trap.invoke_fault(&fault).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
