/*!
 * Completion Port
 * FIFO of I/O completion messages, signaled while non-empty
 */

use super::{wake_up, Object, ObjectType, WaitQueue};
use crate::core::errors::Status;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// One completion message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMsg {
    pub key: u64,
    pub value: u64,
    pub status: Status,
    pub information: u64,
}

#[derive(Debug, Default)]
pub struct Completion {
    queue: RefCell<VecDeque<CompletionMsg>>,
    waiters: WaitQueue,
}

impl Completion {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn add(&self, key: u64, value: u64, status: Status, information: u64) {
        self.queue.borrow_mut().push_back(CompletionMsg {
            key,
            value,
            status,
            information,
        });
        wake_up(self, 1);
    }

    pub fn remove(&self) -> Option<CompletionMsg> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Object for Completion {
    fn object_type(&self) -> ObjectType {
        ObjectType::Completion
    }

    fn dump(&self) -> String {
        format!("Completion queued={}", self.len())
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        !self.is_empty()
    }
}
