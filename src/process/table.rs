/*!
 * Process Table
 *
 * Id allocation and lookup for running processes and threads, and the
 * thread/process exit paths that feed the debugger.
 */

use super::{Process, Thread};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::types::{ClientPtr, ProcessId, ThreadId};
use crate::debugger::{self, EventSource};
use crate::object::wake_up;
use ahash::AHashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// First id handed out; ids are multiples of 4 like handles
const FIRST_ID: u32 = 0x20;

pub struct ProcessTable {
    processes: RefCell<AHashMap<ProcessId, Rc<Process>>>,
    threads: RefCell<AHashMap<ThreadId, Weak<Thread>>>,
    next_id: Cell<u32>,
    max_handles: usize,
    kill_on_exit_default: bool,
}

impl ProcessTable {
    pub fn new(max_handles: usize, kill_on_exit_default: bool) -> Self {
        Self {
            processes: RefCell::new(AHashMap::new()),
            threads: RefCell::new(AHashMap::new()),
            next_id: Cell::new(FIRST_ID),
            max_handles,
            kill_on_exit_default,
        }
    }

    fn alloc_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(4).max(FIRST_ID));
        id
    }

    /// Policy given to a debug context when its thread first attaches
    pub fn kill_on_exit_default(&self) -> bool {
        self.kill_on_exit_default
    }

    pub fn new_process(&self) -> Rc<Process> {
        let process = Process::new(self.alloc_id(), self.max_handles);
        self.processes
            .borrow_mut()
            .insert(process.id(), Rc::clone(&process));
        info!(pid = process.id(), "process created");
        process
    }

    /// Start a thread in `process`
    ///
    /// A debugged process that finished initializing reports the new thread
    /// to its debugger.
    pub fn new_thread(
        &self,
        process: &Rc<Process>,
        teb: ClientPtr,
        entry: ClientPtr,
    ) -> ServerResult<Rc<Thread>> {
        if !process.is_running() {
            return Err(ServerError::access_denied(format!(
                "process {:04x} has exited",
                process.id()
            )));
        }
        let thread = Thread::new(self.alloc_id(), Rc::clone(process), teb, entry);
        process.add_thread(Rc::clone(&thread));
        self.threads
            .borrow_mut()
            .insert(thread.id(), Rc::downgrade(&thread));
        debug!(pid = process.id(), tid = thread.id(), "thread created");

        if process.is_init_done() {
            if let Err(e) = debugger::generate_debug_event(&thread, EventSource::CreateThread) {
                warn!(tid = thread.id(), error = %e, "create-thread debug event dropped");
            }
        }
        Ok(thread)
    }

    pub fn get_process(&self, pid: ProcessId) -> Option<Rc<Process>> {
        self.processes.borrow().get(&pid).cloned()
    }

    pub fn get_thread(&self, tid: ThreadId) -> Option<Rc<Thread>> {
        self.threads.borrow().get(&tid).and_then(Weak::upgrade)
    }

    /// Running processes, ordered by id
    pub fn running(&self) -> Vec<Rc<Process>> {
        let mut running: Vec<_> = self.processes.borrow().values().cloned().collect();
        running.sort_by_key(|p| p.id());
        running
    }

    pub fn process_count(&self) -> usize {
        self.processes.borrow().len()
    }

    /// Terminate a thread; the last thread of a process takes the process down
    pub fn exit_thread(&self, thread: &Rc<Thread>, exit_code: u32) {
        if !thread.is_running() {
            return;
        }
        let process = Rc::clone(thread.process());
        let last = process.thread_count() == 1;

        let source = if last {
            EventSource::ExitProcess(exit_code)
        } else {
            EventSource::ExitThread(exit_code)
        };
        if let Err(e) = debugger::generate_debug_event(thread, source) {
            warn!(tid = thread.id(), error = %e, "exit debug event dropped");
        }
        debugger::debug_exit_thread(self, thread);

        thread.set_exit_code(exit_code);
        process.remove_thread(thread);
        self.threads.borrow_mut().remove(&thread.id());
        wake_up(thread.as_ref(), 0);
        debug!(pid = process.id(), tid = thread.id(), exit_code, "thread exited");

        if last {
            self.process_killed(&process, exit_code);
        }
    }

    /// Terminate every thread of a process
    pub fn kill_process(&self, process: &Rc<Process>, exit_code: u32) {
        if !process.is_running() {
            return;
        }
        let threads = process.threads();
        if threads.is_empty() {
            self.process_killed(process, exit_code);
            return;
        }
        for thread in threads {
            self.exit_thread(&thread, exit_code);
        }
    }

    fn process_killed(&self, process: &Rc<Process>, exit_code: u32) {
        process.set_exit_code(exit_code);
        process.release_resources();
        self.processes.borrow_mut().remove(&process.id());
        wake_up(process.as_ref(), 0);
        info!(pid = process.id(), exit_code, "process exited");
    }
}
