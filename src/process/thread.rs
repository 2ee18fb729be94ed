/*!
 * Thread Records
 */

use super::Process;
use crate::core::flags::{Access, GenericMapping};
use crate::core::types::{ClientPtr, ThreadId};
use crate::debugger::{DebugCtx, DebugEvent};
use crate::object::{Object, ObjectType, WaitQueue};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

const THREAD_MAPPING: GenericMapping = GenericMapping {
    read: Access::READ_CONTROL.union(Access::from_bits_retain(0x0048)),
    write: Access::READ_CONTROL.union(Access::from_bits_retain(0x0037)),
    execute: Access::SYNCHRONIZE.union(Access::from_bits_retain(0x0800)),
    all: Access::THREAD_ALL_ACCESS,
};

pub struct Thread {
    id: ThreadId,
    process: Rc<Process>,
    teb: ClientPtr,
    entry: ClientPtr,
    /// Debug context, present once this thread debugs something
    debug_ctx: RefCell<Option<Rc<DebugCtx>>>,
    /// Event this thread sent and waits to see continued
    debug_event: RefCell<Weak<DebugEvent>>,
    /// Exception event whose register context is current
    context: RefCell<Weak<DebugEvent>>,
    exit_code: Cell<Option<u32>>,
    waiters: WaitQueue,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, process: Rc<Process>, teb: ClientPtr, entry: ClientPtr) -> Rc<Self> {
        Rc::new(Self {
            id,
            process,
            teb,
            entry,
            debug_ctx: RefCell::new(None),
            debug_event: RefCell::new(Weak::new()),
            context: RefCell::new(Weak::new()),
            exit_code: Cell::new(None),
            waiters: WaitQueue::new(),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn process(&self) -> &Rc<Process> {
        &self.process
    }

    pub fn teb(&self) -> ClientPtr {
        self.teb
    }

    pub fn entry(&self) -> ClientPtr {
        self.entry
    }

    pub fn debug_ctx(&self) -> Option<Rc<DebugCtx>> {
        self.debug_ctx.borrow().clone()
    }

    pub(crate) fn set_debug_ctx(&self, ctx: Option<Rc<DebugCtx>>) -> Option<Rc<DebugCtx>> {
        std::mem::replace(&mut *self.debug_ctx.borrow_mut(), ctx)
    }

    /// The sent event still waiting for a continue, if any
    pub fn debug_event(&self) -> Option<Rc<DebugEvent>> {
        self.debug_event.borrow().upgrade()
    }

    pub(crate) fn set_debug_event(&self, event: Option<&Rc<DebugEvent>>) {
        *self.debug_event.borrow_mut() = event.map_or_else(Weak::new, Rc::downgrade);
    }

    pub fn context_event(&self) -> Option<Rc<DebugEvent>> {
        self.context.borrow().upgrade()
    }

    pub(crate) fn set_context_event(&self, event: Option<&Rc<DebugEvent>>) {
        *self.context.borrow_mut() = event.map_or_else(Weak::new, Rc::downgrade);
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code.get()
    }

    pub fn is_running(&self) -> bool {
        self.exit_code.get().is_none()
    }

    pub(crate) fn set_exit_code(&self, code: u32) {
        self.exit_code.set(Some(code));
    }
}

impl Object for Thread {
    fn object_type(&self) -> ObjectType {
        ObjectType::Thread
    }

    fn dump(&self) -> String {
        format!("Thread tid={:04x} pid={:04x}", self.id, self.process.id())
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        !self.is_running()
    }

    fn map_access(&self, access: Access) -> Access {
        access.map_generic(&THREAD_MAPPING)
    }
}
