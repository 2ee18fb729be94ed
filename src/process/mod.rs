/*!
 * Process Records
 *
 * The client-side entities the object broker works for: processes own their
 * threads, handle table and module list; threads point back at their
 * process. A process lists its threads only while they run, so exiting a
 * thread breaks the process ↔ thread cycle.
 */

pub mod table;
pub mod thread;

pub use table::ProcessTable;
pub use thread::Thread;

use crate::core::flags::{Access, GenericMapping};
use crate::core::types::{ClientPtr, ModuleInfo, ProcessId};
use crate::fs::FileLock;
use crate::object::{HandleTable, Object, ObjectType, WaitQueue};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::debug;

const PROCESS_MAPPING: GenericMapping = GenericMapping {
    read: Access::READ_CONTROL.union(Access::from_bits_retain(0x0410)),
    write: Access::READ_CONTROL.union(Access::from_bits_retain(0x0bea)),
    execute: Access::SYNCHRONIZE.union(Access::from_bits_retain(0x1000)),
    all: Access::PROCESS_ALL_ACCESS,
};

/// A module mapped into a process: the main executable or a DLL
#[derive(Clone)]
pub struct ProcessDll {
    /// Backing file, handed to debuggers as a handle
    pub file: Option<Rc<dyn Object>>,
    pub base: ClientPtr,
    pub dbg_offset: u32,
    pub dbg_size: u32,
    /// Client pointer to the module name
    pub name: ClientPtr,
}

impl ProcessDll {
    pub fn new(info: &ModuleInfo, file: Option<Rc<dyn Object>>) -> Self {
        Self {
            file,
            base: info.base,
            dbg_offset: info.dbg_offset,
            dbg_size: info.dbg_size,
            name: info.name,
        }
    }
}

impl std::fmt::Debug for ProcessDll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDll")
            .field("base", &format_args!("{:#x}", self.base))
            .field("has_file", &self.file.is_some())
            .finish()
    }
}

pub struct Process {
    id: ProcessId,
    threads: RefCell<Vec<Rc<Thread>>>,
    debugger: RefCell<Weak<Thread>>,
    suspend: Cell<u32>,
    init_done: Cell<bool>,
    debug_flag: Cell<bool>,
    console_renderer: Cell<Option<ProcessId>>,
    locks: RefCell<Vec<Weak<FileLock>>>,
    handles: HandleTable,
    exe: RefCell<Option<ProcessDll>>,
    dlls: RefCell<Vec<ProcessDll>>,
    exit_code: Cell<Option<u32>>,
    waiters: WaitQueue,
}

impl Process {
    pub fn new(id: ProcessId, max_handles: usize) -> Rc<Self> {
        Rc::new(Self {
            id,
            threads: RefCell::new(Vec::new()),
            debugger: RefCell::new(Weak::new()),
            suspend: Cell::new(0),
            init_done: Cell::new(false),
            debug_flag: Cell::new(false),
            console_renderer: Cell::new(None),
            locks: RefCell::new(Vec::new()),
            handles: HandleTable::new(max_handles),
            exe: RefCell::new(None),
            dlls: RefCell::new(Vec::new()),
            exit_code: Cell::new(None),
            waiters: WaitQueue::new(),
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Running threads in creation order
    pub fn threads(&self) -> Vec<Rc<Thread>> {
        self.threads.borrow().clone()
    }

    pub fn first_thread(&self) -> Option<Rc<Thread>> {
        self.threads.borrow().first().cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.borrow().len()
    }

    pub(crate) fn add_thread(&self, thread: Rc<Thread>) {
        self.threads.borrow_mut().push(thread);
    }

    pub(crate) fn remove_thread(&self, thread: &Thread) -> Option<Rc<Thread>> {
        let mut threads = self.threads.borrow_mut();
        let pos = threads
            .iter()
            .position(|t| std::ptr::eq(t.as_ref(), thread))?;
        Some(threads.remove(pos))
    }

    pub fn debugger(&self) -> Option<Rc<Thread>> {
        self.debugger.borrow().upgrade()
    }

    pub(crate) fn set_debugger(&self, debugger: Option<&Rc<Thread>>) {
        *self.debugger.borrow_mut() = debugger.map_or_else(Weak::new, Rc::downgrade);
    }

    pub fn is_debugged(&self) -> bool {
        self.debug_flag.get()
    }

    pub(crate) fn set_debug_flag(&self, flag: bool) {
        self.debug_flag.set(flag);
    }

    pub fn suspend(&self) {
        self.suspend.set(self.suspend.get() + 1);
    }

    pub fn resume(&self) {
        let count = self.suspend.get();
        if count == 0 {
            debug!(pid = self.id, "resume of a running process ignored");
            return;
        }
        self.suspend.set(count - 1);
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend.get()
    }

    pub fn is_init_done(&self) -> bool {
        self.init_done.get()
    }

    pub fn set_init_done(&self) {
        self.init_done.set(true);
    }

    /// Process rendering this process's console, if any
    pub fn console_renderer(&self) -> Option<ProcessId> {
        self.console_renderer.get()
    }

    pub fn set_console_renderer(&self, renderer: Option<ProcessId>) {
        self.console_renderer.set(renderer);
    }

    pub(crate) fn add_lock(&self, lock: &Rc<FileLock>) {
        self.locks.borrow_mut().push(Rc::downgrade(lock));
    }

    pub(crate) fn remove_lock(&self, lock: &Rc<FileLock>) {
        self.locks
            .borrow_mut()
            .retain(|w| !std::ptr::eq(w.as_ptr(), Rc::as_ptr(lock)));
    }

    /// Detach and return every lock still owned
    pub(crate) fn take_locks(&self) -> Vec<Rc<FileLock>> {
        std::mem::take(&mut *self.locks.borrow_mut())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn exe(&self) -> Option<ProcessDll> {
        self.exe.borrow().clone()
    }

    pub fn set_exe(&self, exe: ProcessDll) {
        *self.exe.borrow_mut() = Some(exe);
    }

    /// Loaded DLLs in load order
    pub fn dlls(&self) -> Vec<ProcessDll> {
        self.dlls.borrow().clone()
    }

    pub fn add_dll(&self, dll: ProcessDll) {
        self.dlls.borrow_mut().push(dll);
    }

    pub fn remove_dll(&self, base: ClientPtr) -> Option<ProcessDll> {
        let mut dlls = self.dlls.borrow_mut();
        let pos = dlls.iter().position(|dll| dll.base == base)?;
        Some(dlls.remove(pos))
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

    /// Release everything the process holds once its last thread is gone
    pub(crate) fn release_resources(&self) {
        crate::fs::remove_process_locks(self);
        self.handles.clear();
        self.dlls.borrow_mut().clear();
        self.exe.borrow_mut().take();
        self.set_debugger(None);
        self.debug_flag.set(false);
    }
}

impl Object for Process {
    fn object_type(&self) -> ObjectType {
        ObjectType::Process
    }

    fn dump(&self) -> String {
        format!(
            "Process pid={:04x} threads={} suspend={} handles={}",
            self.id,
            self.threads.borrow().len(),
            self.suspend.get(),
            self.handles.len()
        )
    }

    fn wait_queue(&self) -> Option<&WaitQueue> {
        Some(&self.waiters)
    }

    fn signaled(&self) -> bool {
        !self.is_running()
    }

    fn map_access(&self, access: Access) -> Access {
        access.map_generic(&PROCESS_MAPPING)
    }
}
