/*!
 * Debug Events
 *
 * One typed notification on its way from a debuggee thread to a debugger.
 * Handles named in the payload live in the debugger's process; they are
 * closed again if the debugger never received them.
 */

use crate::core::errors::Status;
use crate::core::types::{ClientPtr, Handle};
use crate::object::{wake_up, Object, ObjectType, WaitQueue};
use crate::process::{Process, Thread};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::debug;

/// Lifecycle of a debug event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Linked on the debugger's queue, not yet delivered
    Queued,
    /// Delivered, waiting for the debugger's continue
    Sent,
    Continued,
}

/// Exception description captured from the faulting thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub code: u32,
    pub flags: u32,
    /// Client pointer to a nested record
    pub record: ClientPtr,
    pub address: ClientPtr,
    pub params: Vec<u64>,
}

/// Event body as delivered to the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugEventPayload {
    Exception {
        first: bool,
        record: ExceptionRecord,
    },
    CreateThread {
        handle: Handle,
        teb: ClientPtr,
        start: ClientPtr,
    },
    CreateProcess {
        file: Handle,
        process: Handle,
        thread: Handle,
        base: ClientPtr,
        dbg_offset: u32,
        dbg_size: u32,
        teb: ClientPtr,
        start: ClientPtr,
        name: ClientPtr,
    },
    ExitThread {
        exit_code: u32,
    },
    ExitProcess {
        exit_code: u32,
    },
    LoadDll {
        handle: Handle,
        base: ClientPtr,
        dbg_offset: u32,
        dbg_size: u32,
        name: ClientPtr,
    },
    UnloadDll {
        base: ClientPtr,
    },
    OutputString {
        string: ClientPtr,
        unicode: bool,
        length: u32,
    },
}

impl DebugEventPayload {
    /// Handles the payload transfers to the debugger
    pub fn handles(&self) -> Vec<Handle> {
        let handles = match self {
            DebugEventPayload::CreateThread { handle, .. } => vec![*handle],
            DebugEventPayload::CreateProcess {
                file,
                process,
                thread,
                ..
            } => vec![*file, *process, *thread],
            DebugEventPayload::LoadDll { handle, .. } => vec![*handle],
            _ => Vec::new(),
        };
        handles.into_iter().filter(|h| !h.is_none()).collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            DebugEventPayload::Exception { .. } => "exception",
            DebugEventPayload::CreateThread { .. } => "create_thread",
            DebugEventPayload::CreateProcess { .. } => "create_process",
            DebugEventPayload::ExitThread { .. } => "exit_thread",
            DebugEventPayload::ExitProcess { .. } => "exit_process",
            DebugEventPayload::LoadDll { .. } => "load_dll",
            DebugEventPayload::UnloadDll { .. } => "unload_dll",
            DebugEventPayload::OutputString { .. } => "output_string",
        }
    }
}

pub struct DebugEvent {
    sender: Rc<Thread>,
    debugger: Weak<Thread>,
    debugger_process: Weak<Process>,
    state: Cell<EventState>,
    delivered: Cell<bool>,
    status: Cell<Status>,
    payload: DebugEventPayload,
    context: RefCell<Vec<u8>>,
    waiters: WaitQueue,
}

impl DebugEvent {
    pub(crate) fn new(
        sender: Rc<Thread>,
        debugger: &Rc<Thread>,
        payload: DebugEventPayload,
        context: Vec<u8>,
    ) -> Rc<Self> {
        Rc::new(Self {
            sender,
            debugger: Rc::downgrade(debugger),
            debugger_process: Rc::downgrade(debugger.process()),
            state: Cell::new(EventState::Queued),
            delivered: Cell::new(false),
            status: Cell::new(Status::UNSUCCESSFUL),
            payload,
            context: RefCell::new(context),
            waiters: WaitQueue::new(),
        })
    }

    pub fn sender(&self) -> &Rc<Thread> {
        &self.sender
    }

    pub fn debugger(&self) -> Option<Rc<Thread>> {
        self.debugger.upgrade()
    }

    pub fn state(&self) -> EventState {
        self.state.get()
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn payload(&self) -> &DebugEventPayload {
        &self.payload
    }

    /// Register context captured with an exception
    pub fn context(&self) -> Vec<u8> {
        self.context.borrow().clone()
    }

    pub(crate) fn mark_sent(&self) {
        self.state.set(EventState::Sent);
        self.delivered.set(true);
    }

    /// Record the debugger's answer and release waiters
    pub(crate) fn mark_continued(&self, status: Status) {
        self.status.set(status);
        self.state.set(EventState::Continued);
        wake_up(self, 0);
    }
}

impl Drop for DebugEvent {
    fn drop(&mut self) {
        if self.delivered.get() {
            return;
        }
        let Some(process) = self.debugger_process.upgrade() else {
            return;
        };
        for handle in self.payload.handles() {
            if let Err(e) = process.handles().close(handle) {
                debug!(%handle, error = %e, "undelivered debug handle already gone");
            }
        }
    }
}

impl Object for DebugEvent {
    fn object_type(&self) -> ObjectType {
        ObjectType::DebugEvent
    }

    fn dump(&self) -> String {
        format!(
            "DebugEvent {} sender={:04x} state={:?}",
            self.payload.name(),
            self.sender.id(),
            self.state.get()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        self.state.get() == EventState::Continued
    }
}
