/*!
 * Debug Context
 * Per-debugger FIFO of pending events
 */

use super::event::{DebugEvent, EventState};
use crate::object::{wake_up, Object, ObjectType, WaitQueue};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub struct DebugCtx {
    events: RefCell<VecDeque<Rc<DebugEvent>>>,
    kill_on_exit: Cell<bool>,
    waiters: WaitQueue,
}

impl DebugCtx {
    pub fn new(kill_on_exit: bool) -> Rc<Self> {
        Rc::new(Self {
            events: RefCell::new(VecDeque::new()),
            kill_on_exit: Cell::new(kill_on_exit),
            waiters: WaitQueue::new(),
        })
    }

    pub fn kill_on_exit(&self) -> bool {
        self.kill_on_exit.get()
    }

    pub fn set_kill_on_exit(&self, kill: bool) {
        self.kill_on_exit.set(kill);
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn events(&self) -> Vec<Rc<DebugEvent>> {
        self.events.borrow().iter().cloned().collect()
    }

    /// First queued event whose sender is not still waiting on another one
    pub fn find_event_to_send(&self) -> Option<Rc<DebugEvent>> {
        self.events
            .borrow()
            .iter()
            .filter(|event| event.state() != EventState::Sent)
            .find(|event| event.sender().debug_event().is_none())
            .cloned()
    }

    pub(crate) fn link(&self, event: Rc<DebugEvent>) {
        let busy = event.sender().debug_event().is_some();
        self.events.borrow_mut().push_back(event);
        if !busy {
            wake_up(self, 0);
        }
    }

    /// Drop the event from the queue and free its sender for the next one
    pub(crate) fn unlink(&self, event: &Rc<DebugEvent>) {
        let removed = {
            let mut events = self.events.borrow_mut();
            events
                .iter()
                .position(|e| Rc::ptr_eq(e, event))
                .and_then(|pos| events.remove(pos))
        };
        let sender = event.sender();
        if sender
            .debug_event()
            .map_or(false, |current| Rc::ptr_eq(&current, event))
        {
            sender.set_debug_event(None);
        }
        drop(removed);
    }
}

impl Object for DebugCtx {
    fn object_type(&self) -> ObjectType {
        ObjectType::DebugCtx
    }

    fn dump(&self) -> String {
        format!(
            "DebugCtx events={} kill_on_exit={}",
            self.len(),
            self.kill_on_exit.get()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        self.find_event_to_send().is_some()
    }
}
