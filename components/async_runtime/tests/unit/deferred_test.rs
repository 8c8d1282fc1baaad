//! Unit tests for Deferred

use async_runtime::{
    flush_possibly_unhandled, on_possibly_unhandled, Deferred, DeferredState, MaybeDeferred,
};
use core_types::{ErrorKind, MessageError};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

fn error(message: &str) -> MessageError {
    MessageError::new(ErrorKind::HandlerError, message)
}

#[test]
fn new_deferred_is_pending() {
    let deferred: Deferred<u32> = Deferred::new();
    assert_eq!(deferred.state(), DeferredState::Pending);
    assert!(deferred.result().is_none());
}

#[test]
fn resolve_sets_result_value() {
    let deferred: Deferred<u32> = Deferred::new();
    assert!(deferred.resolve(42));
    assert_eq!(deferred.state(), DeferredState::Resolved);
    assert_eq!(deferred.result(), Some(Ok(42)));
}

#[test]
fn cannot_resolve_already_resolved_deferred() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.resolve(42);
    assert!(!deferred.resolve(100));
    assert_eq!(deferred.result(), Some(Ok(42)));
}

#[test]
fn cannot_reject_already_resolved_deferred() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.resolve(42);
    assert!(!deferred.reject(error("late")));
    assert_eq!(deferred.state(), DeferredState::Resolved);
}

#[test]
fn cannot_resolve_already_rejected_deferred() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.on_settled(|_| {});
    deferred.reject(error("first"));
    assert!(!deferred.resolve(1));
    assert_eq!(deferred.result(), Some(Err(error("first"))));
}

#[test]
fn continuation_runs_synchronously_on_resolve() {
    let deferred: Deferred<&'static str> = Deferred::new();
    let seen: Arc<Mutex<Option<Result<&'static str, MessageError>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    deferred.on_settled(move |result| *slot.lock().unwrap() = Some(result));

    assert!(seen.lock().unwrap().is_none());
    deferred.resolve("ok");
    assert_eq!(*seen.lock().unwrap(), Some(Ok("ok")));
}

#[test]
fn continuation_attached_after_settlement_replays_immediately() {
    let deferred: Deferred<i32> = Deferred::resolved(7);
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::clone(&seen);
    deferred.on_settled(move |result| slot.lock().unwrap().push(result.unwrap()));
    assert_eq!(*seen.lock().unwrap(), vec![7]);
}

#[test]
fn continuations_run_in_attachment_order() {
    let deferred: Deferred<()> = Deferred::new();
    let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    for n in 0..5 {
        let order = Arc::clone(&order);
        deferred.on_settled(move |_| order.lock().unwrap().push(n));
    }
    deferred.resolve(());
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn continuation_attached_during_dispatch_runs_after_earlier_ones() {
    let deferred: Deferred<()> = Deferred::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let inner_handle = deferred.clone();
    let o = Arc::clone(&order);
    deferred.on_settled(move |_| {
        o.lock().unwrap().push("first");
        let o2 = Arc::clone(&o);
        inner_handle.on_settled(move |_| o2.lock().unwrap().push("nested"));
    });
    let o = Arc::clone(&order);
    deferred.on_settled(move |_| o.lock().unwrap().push("second"));

    deferred.resolve(());
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "nested"]);
}

#[test]
fn then_chains_synchronously() {
    let deferred: Deferred<u32> = Deferred::new();
    let chained = deferred.then(|n: u32| Ok(n + 1)).then(|n| Ok(n * 10));
    deferred.resolve(1);
    assert_eq!(chained.result(), Some(Ok(20)));
}

#[test]
fn then_propagates_rejection() {
    let deferred: Deferred<u32> = Deferred::new();
    let chained = deferred.then(|n| Ok(n + 1));
    chained.on_settled(|_| {});
    deferred.reject(error("nope"));
    assert_eq!(chained.result(), Some(Err(error("nope"))));
}

#[test]
fn then_error_rejects_chained() {
    let deferred = Deferred::resolved(1u32);
    let chained: Deferred<u32> = deferred.then(|_| Err(error("bad value")));
    chained.on_settled(|_| {});
    assert_eq!(chained.state(), DeferredState::Rejected);
}

#[test]
fn and_then_flattens_nested_deferred() {
    let outer: Deferred<()> = Deferred::new();
    let inner: Deferred<String> = Deferred::new();
    let inner_handle = inner.clone();
    let flattened = outer.and_then(move |_: ()| inner_handle);

    outer.resolve(());
    assert!(flattened.is_pending());
    inner.resolve("done".to_string());
    assert_eq!(flattened.result(), Some(Ok("done".to_string())));
}

#[test]
fn catch_recovers_from_rejection() {
    let deferred: Deferred<u32> = Deferred::rejected(error("lost"));
    let recovered = deferred.catch(|e| {
        assert_eq!(e.message, "lost");
        Ok(0)
    });
    assert_eq!(recovered.result(), Some(Ok(0)));
}

#[test]
fn finally_runs_and_passes_result_through() {
    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    let deferred = Deferred::resolved(5);
    let after = deferred.finally(move || *flag.lock().unwrap() = true);
    assert!(*ran.lock().unwrap());
    assert_eq!(after.result(), Some(Ok(5)));
}

#[test]
fn try_call_captures_errors() {
    let ok = Deferred::try_call(|| Ok(3));
    assert_eq!(ok.result(), Some(Ok(3)));

    let failed: Deferred<u8> = Deferred::try_call(|| Err(error("thrown")));
    failed.on_settled(|_| {});
    assert_eq!(failed.state(), DeferredState::Rejected);
}

#[test]
fn all_treats_plain_values_as_resolved() {
    let all = Deferred::all(vec![MaybeDeferred::Value(1), MaybeDeferred::Value(2)]);
    assert_eq!(all.result(), Some(Ok(vec![1, 2])));
}

#[test]
fn all_of_nothing_resolves_empty() {
    let all: Deferred<Vec<u8>> = Deferred::all(Vec::new());
    assert_eq!(all.result(), Some(Ok(vec![])));
}

#[test]
fn all_keeps_input_order() {
    let a: Deferred<&'static str> = Deferred::new();
    let b: Deferred<&'static str> = Deferred::new();
    let all = Deferred::all(vec![a.clone().into(), MaybeDeferred::Value("mid"), b.clone().into()]);
    b.resolve("last");
    assert!(all.is_pending());
    a.resolve("first");
    assert_eq!(all.result(), Some(Ok(vec!["first", "mid", "last"])));
}

#[test]
fn all_rejects_on_first_rejection() {
    let a: Deferred<u8> = Deferred::new();
    let b: Deferred<u8> = Deferred::new();
    let all = Deferred::all(vec![a.clone().into(), b.clone().into()]);
    all.on_settled(|_| {});
    b.reject(error("b failed"));
    a.resolve(1);
    assert_eq!(all.result(), Some(Err(error("b failed"))));
}

#[test]
fn unhandled_rejection_reaches_diagnostic_handler() {
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let _guard = on_possibly_unhandled(move |e| sink.borrow_mut().push(e.message.clone()));

    let deferred: Deferred<()> = Deferred::new();
    deferred.reject(error("dropped on the floor"));
    assert_eq!(flush_possibly_unhandled(), 1);
    assert_eq!(*seen.borrow(), vec!["dropped on the floor".to_string()]);
}

#[test]
fn rejection_handled_within_the_tick_is_not_reported() {
    let seen = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&seen);
    let _guard = on_possibly_unhandled(move |_| *sink.borrow_mut() += 1);

    let deferred: Deferred<()> = Deferred::new();
    deferred.reject(error("caught later"));
    let _recovered = deferred.catch(|_| Ok(()));
    flush_possibly_unhandled();
    assert_eq!(*seen.borrow(), 0);
}
