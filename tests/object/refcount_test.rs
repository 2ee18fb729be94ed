/*!
 * Reference Counting Tests
 * Grab/release ordering and the single destroy guarantee
 */

use objbroker::object::{grab, release, Event, Object, WaitEntry};
use objbroker::object::{add_queue, wake_up, Completion};
use objbroker::Status;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::cell::Cell;
use std::rc::Rc;

struct Tracked {
    destroyed: Rc<Cell<u32>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

proptest! {
    /// Any interleaving of grabs and releases destroys exactly once, at the last release
    #[test]
    fn test_interleaved_grab_release(ops in prop::collection::vec(any::<bool>(), 0..64)) {
        let destroyed = Rc::new(Cell::new(0));
        let first = Rc::new(Tracked { destroyed: destroyed.clone() });
        let mut refs = vec![first];

        for grab_op in ops {
            if grab_op || refs.len() == 1 {
                let extra = grab(&refs[0]);
                refs.push(extra);
            } else if let Some(r) = refs.pop() {
                release(r);
            }
            prop_assert_eq!(destroyed.get(), 0);
        }
        while let Some(r) = refs.pop() {
            prop_assert_eq!(destroyed.get(), 0);
            release(r);
        }
        prop_assert_eq!(destroyed.get(), 1);
    }
}

#[test]
fn test_trait_object_release_runs_drop_once() {
    let destroyed = Rc::new(Cell::new(0));
    let tracked = Rc::new(Tracked {
        destroyed: destroyed.clone(),
    });
    let again = grab(&tracked);
    release(tracked);
    assert_eq!(destroyed.get(), 0);
    release(again);
    assert_eq!(destroyed.get(), 1);
}

#[test]
fn test_completion_signals_while_non_empty() {
    let completion = Completion::new();
    let waiter = WaitEntry::new(0x20);
    add_queue(completion.as_ref(), &waiter).unwrap();
    assert!(!completion.signaled());

    completion.add(7, 1, Status::SUCCESS, 10);
    completion.add(7, 2, Status::PENDING, 20);
    assert!(completion.signaled());
    assert_eq!(waiter.wakeups(), 1);

    let first = completion.remove().unwrap();
    assert_eq!((first.key, first.value, first.information), (7, 1, 10));
    let second = completion.remove().unwrap();
    assert_eq!(second.status, Status::PENDING);
    assert!(completion.remove().is_none());
    assert!(!completion.signaled());
}

#[test]
fn test_manual_reset_event_stays_signaled() {
    let event = Event::new(true, false);
    let waiter = WaitEntry::new(0x24);
    add_queue(event.as_ref(), &waiter).unwrap();

    event.set();
    assert_eq!(waiter.wakeups(), 1);
    assert!(event.signaled());
    assert_eq!(wake_up(event.as_ref(), 0), 1);

    event.reset();
    assert_eq!(wake_up(event.as_ref(), 0), 0);
    assert_eq!(waiter.wakeups(), 2);
}
