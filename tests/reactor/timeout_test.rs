/*!
 * Timeout Scheduler Tests
 */

use objbroker::core::types::{TICKS_PER_MS, TICKS_PER_SEC};
use objbroker::reactor::TimeoutScheduler;
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = fired.clone();
    let make = move |name: &'static str| {
        let sink = sink.clone();
        Box::new(move || sink.borrow_mut().push(name)) as Box<dyn FnOnce()>
    };
    (fired, make)
}

#[test]
fn test_equal_deadlines_fire_in_insertion_order() {
    let timeouts = TimeoutScheduler::new();
    timeouts.update_time();
    let now = timeouts.current_time();
    let (fired, cb) = recorder();

    timeouts.add_timeout(now, cb("a"));
    timeouts.add_timeout(now, cb("b"));
    timeouts.add_timeout(now, cb("c"));
    timeouts.add_timeout(now + 3600 * TICKS_PER_SEC, cb("later"));

    let delay = timeouts.get_next_delay().unwrap();
    assert_eq!(*fired.borrow(), vec!["a", "b", "c"]);
    assert!(delay > Duration::from_secs(3590));
    assert!(delay <= Duration::from_secs(3600));
    assert_eq!(timeouts.len(), 1);
}

#[test]
fn test_relative_deadline_is_in_the_future() {
    let timeouts = TimeoutScheduler::new();
    timeouts.update_time();
    let (fired, cb) = recorder();

    timeouts.add_timeout(-60 * TICKS_PER_SEC, cb("relative"));
    let delay = timeouts.get_next_delay().unwrap();
    assert!(fired.borrow().is_empty());
    assert!(delay > Duration::from_secs(59));
}

#[test]
fn test_removed_timeout_never_fires() {
    let timeouts = TimeoutScheduler::new();
    timeouts.update_time();
    let now = timeouts.current_time();
    let (fired, cb) = recorder();

    let gone = timeouts.add_timeout(now, cb("gone"));
    timeouts.add_timeout(now, cb("kept"));
    timeouts.remove_timeout(gone);

    assert!(timeouts.get_next_delay().is_none());
    assert_eq!(*fired.borrow(), vec!["kept"]);
    assert!(timeouts.is_empty());

    // removing after the callback ran is harmless
    timeouts.remove_timeout(gone);
}

#[test]
fn test_callback_may_schedule_more_work() {
    let timeouts = Rc::new(TimeoutScheduler::new());
    timeouts.update_time();
    let now = timeouts.current_time();
    let (fired, cb) = recorder();

    let inner = cb("inner");
    let sched = timeouts.clone();
    timeouts.add_timeout(
        now,
        Box::new(move || {
            sched.add_timeout(now + 10 * TICKS_PER_MS, inner);
        }),
    );

    let delay = timeouts.get_next_delay().unwrap();
    assert!(delay <= Duration::from_millis(10));
    assert!(fired.borrow().is_empty());
    assert_eq!(timeouts.len(), 1);
}
