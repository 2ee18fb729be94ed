/*!
 * Event Object
 * Waitable flag, manual or auto reset
 */

use super::{wake_up, Object, ObjectType, WaitQueue};
use crate::core::errors::ServerResult;
use crate::core::flags::Access;
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug)]
pub struct Event {
    manual_reset: bool,
    signaled: Cell<bool>,
    queue: WaitQueue,
}

impl Event {
    pub fn new(manual_reset: bool, initial: bool) -> Rc<Self> {
        Rc::new(Self {
            manual_reset,
            signaled: Cell::new(initial),
            queue: WaitQueue::new(),
        })
    }

    pub fn set(&self) {
        self.signaled.set(true);
        wake_up(self, 0);
    }

    pub fn reset(&self) {
        self.signaled.set(false);
    }
}

impl Object for Event {
    fn object_type(&self) -> ObjectType {
        ObjectType::Event
    }

    fn dump(&self) -> String {
        format!(
            "Event manual={} signaled={}",
            self.manual_reset,
            self.signaled.get()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.queue)
    }

    fn signaled(&self) -> bool {
        self.signaled.get()
    }

    fn satisfied(&self) {
        if !self.manual_reset {
            self.signaled.set(false);
        }
    }

    fn signal(&self, _access: Access) -> ServerResult<()> {
        self.set();
        Ok(())
    }
}
