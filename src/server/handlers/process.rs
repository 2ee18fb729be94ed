/*!
 * Process Request Handler
 * Process and thread lifecycle, module list, console renderer
 */

use super::{require_caller, RequestHandler};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::flags::Access;
use crate::core::types::{ClientPtr, Handle, ModuleInfo};
use crate::debugger::{self, EventSource};
use crate::object::{HandleTransaction, Object};
use crate::process::{Process, ProcessDll, Thread};
use crate::server::{Reply, Request, Server};
use std::rc::Rc;
use tracing::info;

const PROCESS_TERMINATE: Access = Access::from_bits_retain(0x0001);

/// Optional object behind a handle; `Handle::NONE` means none
fn optional_object(thread: &Thread, handle: Handle) -> ServerResult<Option<Rc<dyn Object>>> {
    if handle.is_none() {
        return Ok(None);
    }
    thread
        .process()
        .handles()
        .get(handle, Access::empty())
        .map(Some)
}

pub struct ProcessHandler;

impl ProcessHandler {
    fn new_process(
        server: &Server,
        caller: Option<&Rc<Thread>>,
        debug: bool,
        teb: ClientPtr,
        entry: ClientPtr,
    ) -> ServerResult<Reply> {
        if debug && caller.is_none() {
            return Err(ServerError::invalid_parameter(
                "a debugged process needs a debugger thread",
            ));
        }
        let table = server.processes();
        let process = table.new_process();
        let thread = table.new_thread(&process, teb, entry)?;

        let (process_handle, thread_handle) = match caller {
            Some(parent) => {
                let mut tx = HandleTransaction::new(parent.process().handles());
                let handles = tx
                    .alloc(process.clone(), Access::PROCESS_ALL_ACCESS)
                    .and_then(|p| Ok((p, tx.alloc(thread.clone(), Access::THREAD_ALL_ACCESS)?)));
                match handles {
                    Ok(handles) => {
                        tx.commit();
                        handles
                    }
                    Err(e) => {
                        drop(tx);
                        table.kill_process(&process, 0);
                        return Err(e);
                    }
                }
            }
            None => (Handle::NONE, Handle::NONE),
        };

        if let Some(parent) = caller.filter(|_| debug) {
            debugger::set_process_debugger(&process, parent, table.kill_on_exit_default());
        }
        let debugged = debug;
        info!(pid = process.id(), tid = thread.id(), debug = debugged, "new process");
        Ok(Reply::NewProcess {
            pid: process.id(),
            tid: thread.id(),
            process: process_handle,
            thread: thread_handle,
        })
    }

    fn init_process_done(
        thread: &Thread,
        module: &ModuleInfo,
        exe_file: Handle,
        entry: ClientPtr,
    ) -> ServerResult<Reply> {
        let process = thread.process();
        if process.is_init_done() {
            return Err(ServerError::invalid_parameter(format!(
                "process {:04x} already initialized",
                process.id()
            )));
        }
        let file = optional_object(thread, exe_file)?;
        process.set_exe(ProcessDll::new(module, file));
        process.set_init_done();
        if process.is_debugged() {
            debugger::generate_startup_debug_events(process, entry)?;
        }
        Ok(Reply::Done)
    }
}

impl RequestHandler for ProcessHandler {
    fn handle(
        &self,
        server: &Server,
        caller: Option<&Rc<Thread>>,
        request: &Request,
    ) -> Option<ServerResult<Reply>> {
        let result = match request {
            Request::NewProcess { debug, teb, entry } => {
                Self::new_process(server, caller, *debug, *teb, *entry)
            }
            Request::NewThread { teb, entry } => require_caller(caller).and_then(|parent| {
                let thread = server.processes().new_thread(parent.process(), *teb, *entry)?;
                let handle = parent
                    .process()
                    .handles()
                    .alloc(thread.clone(), Access::THREAD_ALL_ACCESS);
                match handle {
                    Ok(handle) => Ok(Reply::NewThread {
                        tid: thread.id(),
                        handle,
                    }),
                    Err(e) => {
                        server.processes().exit_thread(&thread, 0);
                        Err(e)
                    }
                }
            }),
            Request::InitProcessDone {
                module,
                exe_file,
                entry,
            } => require_caller(caller)
                .and_then(|thread| Self::init_process_done(thread, module, *exe_file, *entry)),
            Request::LoadDll { module, file } => require_caller(caller).and_then(|thread| {
                let dll = ProcessDll::new(module, optional_object(thread, *file)?);
                thread.process().add_dll(dll.clone());
                debugger::generate_debug_event(thread, EventSource::LoadDll(dll))?;
                Ok(Reply::Done)
            }),
            Request::UnloadDll { base } => require_caller(caller).and_then(|thread| {
                thread.process().remove_dll(*base).ok_or_else(|| {
                    ServerError::invalid_parameter(format!("no module at {:#x}", base))
                })?;
                debugger::generate_debug_event(thread, EventSource::UnloadDll(*base))?;
                Ok(Reply::Done)
            }),
            Request::ExitThread { exit_code } => require_caller(caller).map(|thread| {
                server.processes().exit_thread(thread, *exit_code);
                Reply::Done
            }),
            Request::TerminateProcess { handle, exit_code } => {
                require_caller(caller).and_then(|thread| {
                    let process = thread
                        .process()
                        .handles()
                        .get_typed::<Process>(*handle, PROCESS_TERMINATE)?;
                    server.processes().kill_process(&process, *exit_code);
                    Ok(Reply::Done)
                })
            }
            Request::SetConsoleRenderer { renderer } => require_caller(caller).map(|thread| {
                thread.process().set_console_renderer(*renderer);
                Reply::Done
            }),
            _ => return None,
        };
        Some(result)
    }

    fn name(&self) -> &'static str {
        "process_handler"
    }
}
