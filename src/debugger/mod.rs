/*!
 * Debugger Core
 *
 * Debuggee state changes become `DebugEvent`s queued on the debugger
 * thread's `DebugCtx`. Each queued event suspends the debuggee process once;
 * the debugger's continue resumes it. A sender thread has at most one event
 * delivered and not yet continued.
 */

pub mod ctx;
pub mod event;

pub use ctx::DebugCtx;
pub use event::{DebugEvent, DebugEventPayload, EventState, ExceptionRecord};

use crate::core::bincode;
use crate::core::errors::{ServerError, ServerResult, Status};
use crate::core::flags::Access;
use crate::core::limits::EXCEPTION_MAXIMUM_PARAMETERS;
use crate::core::types::{ClientPtr, Handle, ProcessId, ThreadId};
use crate::object::{wake_up, HandleTransaction};
use crate::process::{Process, ProcessDll, ProcessTable, Thread};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Right needed on a process handle to break into it
const PROCESS_SET_INFORMATION: Access = Access::from_bits_retain(0x0200);

/// Exception flag of a continuable exception
const EXCEPTION_CONTINUABLE: u32 = 0;

/// State change to report; handles are created when the event is built
#[derive(Debug, Clone)]
pub enum EventSource {
    Exception { first: bool, record: ExceptionRecord },
    CreateThread,
    CreateProcess { entry: ClientPtr },
    ExitThread(u32),
    ExitProcess(u32),
    LoadDll(ProcessDll),
    UnloadDll(ClientPtr),
    OutputString {
        string: ClientPtr,
        unicode: bool,
        length: u32,
    },
}

/// Answer to a debugger's wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugWait {
    /// An event was delivered; `data` is the encoded payload, possibly truncated
    Event {
        pid: ProcessId,
        tid: ThreadId,
        data: Vec<u8>,
    },
    /// Nothing to deliver; `wait` is signaled once something is, or none if not asked for
    NotReady { wait: Handle },
}

/// Build an event from `sender` for `debugger`
///
/// Every handle the payload names is allocated in the debugger's process.
/// If one allocation fails the ones before it are closed and no event exists.
pub fn alloc_debug_event(
    sender: &Rc<Thread>,
    debugger: &Rc<Thread>,
    source: EventSource,
    context: Vec<u8>,
) -> ServerResult<Rc<DebugEvent>> {
    let mut tx = HandleTransaction::new(debugger.process().handles());
    let payload = match source {
        EventSource::Exception { first, mut record } => {
            record.params.truncate(EXCEPTION_MAXIMUM_PARAMETERS);
            DebugEventPayload::Exception { first, record }
        }
        EventSource::CreateThread => DebugEventPayload::CreateThread {
            handle: tx.alloc(sender.clone(), Access::THREAD_ALL_ACCESS)?,
            teb: sender.teb(),
            start: sender.entry(),
        },
        EventSource::CreateProcess { entry } => {
            let process = sender.process();
            let process_handle = tx.alloc(process.clone(), Access::PROCESS_ALL_ACCESS)?;
            let thread_handle = tx.alloc(sender.clone(), Access::THREAD_ALL_ACCESS)?;
            let exe = process.exe();
            let file = match exe.as_ref().and_then(|exe| exe.file.clone()) {
                Some(file) => tx.alloc(file, Access::GENERIC_READ)?,
                None => Handle::NONE,
            };
            DebugEventPayload::CreateProcess {
                file,
                process: process_handle,
                thread: thread_handle,
                base: exe.as_ref().map_or(0, |exe| exe.base),
                dbg_offset: exe.as_ref().map_or(0, |exe| exe.dbg_offset),
                dbg_size: exe.as_ref().map_or(0, |exe| exe.dbg_size),
                teb: sender.teb(),
                start: entry,
                name: exe.as_ref().map_or(0, |exe| exe.name),
            }
        }
        EventSource::ExitThread(exit_code) => DebugEventPayload::ExitThread { exit_code },
        EventSource::ExitProcess(exit_code) => DebugEventPayload::ExitProcess { exit_code },
        EventSource::LoadDll(dll) => DebugEventPayload::LoadDll {
            handle: match dll.file {
                Some(file) => tx.alloc(file, Access::GENERIC_READ)?,
                None => Handle::NONE,
            },
            base: dll.base,
            dbg_offset: dll.dbg_offset,
            dbg_size: dll.dbg_size,
            name: dll.name,
        },
        EventSource::UnloadDll(base) => DebugEventPayload::UnloadDll { base },
        EventSource::OutputString {
            string,
            unicode,
            length,
        } => DebugEventPayload::OutputString {
            string,
            unicode,
            length,
        },
    };
    tx.commit();
    Ok(DebugEvent::new(Rc::clone(sender), debugger, payload, context))
}

/// Debugger and context that events from `process` go to
fn active_debugger(process: &Process) -> Option<(Rc<Thread>, Rc<DebugCtx>)> {
    if !process.is_debugged() {
        return None;
    }
    let debugger = process.debugger()?;
    let ctx = debugger.debug_ctx()?;
    Some((debugger, ctx))
}

/// Queue an event from `thread` if its process is debugged
pub fn generate_debug_event(
    thread: &Rc<Thread>,
    source: EventSource,
) -> ServerResult<Option<Rc<DebugEvent>>> {
    let process = thread.process();
    let Some((debugger, ctx)) = active_debugger(process) else {
        return Ok(None);
    };
    let event = alloc_debug_event(thread, &debugger, source, Vec::new())?;
    debug!(
        pid = process.id(),
        tid = thread.id(),
        debugger = debugger.id(),
        event = event.payload().name(),
        "debug event queued"
    );
    ctx.link(Rc::clone(&event));
    process.suspend();
    Ok(Some(event))
}

/// Report the state of an already running process to a new debugger
///
/// Create-process for the first thread, create-thread for the others, then
/// a load-dll for every module in load order.
pub fn generate_startup_debug_events(process: &Rc<Process>, entry: ClientPtr) -> ServerResult<()> {
    let threads = process.threads();
    let Some(first) = threads.first() else {
        return Ok(());
    };
    for (i, thread) in threads.iter().enumerate() {
        let source = if i == 0 {
            EventSource::CreateProcess { entry }
        } else {
            EventSource::CreateThread
        };
        generate_debug_event(thread, source)?;
    }
    for dll in process.dlls() {
        generate_debug_event(first, EventSource::LoadDll(dll))?;
    }
    Ok(())
}

/// Make `debugger` the debugger of a process created under it
pub fn set_process_debugger(process: &Process, debugger: &Rc<Thread>, kill_on_exit: bool) {
    if debugger.debug_ctx().is_none() {
        debugger.set_debug_ctx(Some(DebugCtx::new(kill_on_exit)));
    }
    process.set_debugger(Some(debugger));
    process.set_debug_flag(true);
}

/// Attach `debugger` to a running process, leaving it suspended once
pub fn debugger_attach(
    process: &Rc<Process>,
    debugger: &Rc<Thread>,
    kill_on_exit: bool,
) -> ServerResult<()> {
    let deny = |why: &str| {
        warn!(pid = process.id(), debugger = debugger.id(), why, "debugger attach refused");
        Err(ServerError::access_denied(format!(
            "cannot debug process {:04x}: {}",
            process.id(),
            why
        )))
    };
    if process.debugger().is_some() || process.is_debugged() {
        return deny("already debugged");
    }
    if !process.is_init_done() {
        return deny("still starting up");
    }
    if process.thread_count() == 0 {
        return deny("no running thread");
    }
    let mut link = Some(Rc::clone(debugger));
    while let Some(thread) = link {
        if Rc::ptr_eq(thread.process(), process) {
            return deny("debugger loop");
        }
        link = thread.process().debugger();
    }
    if debugger.process().console_renderer() == Some(process.id()) {
        return deny("target renders the debugger's console");
    }

    process.suspend();
    set_process_debugger(process, debugger, kill_on_exit);
    info!(pid = process.id(), debugger = debugger.id(), "debugger attached");
    Ok(())
}

/// Detach `debugger`, continuing every event from the process it has not continued yet
///
/// Queued and delivered events alike are answered with `DBG_CONTINUE`, so
/// each one gives back the suspend it took.
pub fn debugger_detach(process: &Rc<Process>, debugger: &Rc<Thread>) -> ServerResult<()> {
    let attached = process
        .debugger()
        .map_or(false, |current| Rc::ptr_eq(&current, debugger));
    if !attached {
        return Err(ServerError::access_denied(format!(
            "process {:04x} is not debugged by thread {:04x}",
            process.id(),
            debugger.id()
        )));
    }

    process.suspend();
    let mut continued = 0;
    if let Some(ctx) = debugger.debug_ctx() {
        for event in ctx.events() {
            if event.state() == EventState::Continued
                || !Rc::ptr_eq(event.sender().process(), process)
            {
                continue;
            }
            event.mark_continued(Status::DBG_CONTINUE);
            ctx.unlink(&event);
            process.resume();
            continued += 1;
        }
        if continued > 0 {
            wake_up(ctx.as_ref(), 0);
        }
    }
    process.set_debugger(None);
    process.set_debug_flag(false);
    process.resume();
    info!(pid = process.id(), debugger = debugger.id(), continued, "debugger detached");
    Ok(())
}

/// Attach to or detach from the process `pid`
///
/// Attaching also reports the process's current state and breaks into it.
pub fn debug_process(
    table: &ProcessTable,
    debugger: &Rc<Thread>,
    pid: ProcessId,
    attach: bool,
) -> ServerResult<()> {
    let process = table
        .get_process(pid)
        .ok_or_else(|| ServerError::invalid_parameter(format!("no process {:04x}", pid)))?;
    if !attach {
        return debugger_detach(&process, debugger);
    }
    debugger_attach(&process, debugger, table.kill_on_exit_default())?;
    let result = generate_startup_debug_events(&process, 0).and_then(|()| break_process(&process));
    if let Err(e) = &result {
        warn!(pid, debugger = debugger.id(), error = %e, "attach unwound");
        debugger_detach(&process, debugger)?;
    }
    process.resume();
    result
}

/// Next event for the debugger thread, or a handle to wait for one
pub fn wait_debug_event(
    thread: &Rc<Thread>,
    want_handle: bool,
    reply_max: usize,
) -> ServerResult<DebugWait> {
    let ctx = thread
        .debug_ctx()
        .ok_or(ServerError::InvalidHandle(Handle::NONE.0))?;
    match ctx.find_event_to_send() {
        Some(event) => {
            event.mark_sent();
            let sender = event.sender();
            sender.set_debug_event(Some(&event));
            let data = bincode::to_reply(event.payload(), reply_max)?;
            debug!(
                debugger = thread.id(),
                tid = sender.id(),
                event = event.payload().name(),
                "debug event sent"
            );
            Ok(DebugWait::Event {
                pid: sender.process().id(),
                tid: sender.id(),
                data,
            })
        }
        None if want_handle => {
            let wait = thread.process().handles().alloc(ctx, Access::SYNCHRONIZE)?;
            Ok(DebugWait::NotReady { wait })
        }
        None => Ok(DebugWait::NotReady { wait: Handle::NONE }),
    }
}

/// Answer the delivered event of thread `tid` in process `pid`
pub fn continue_debug_event(
    thread: &Rc<Thread>,
    pid: ProcessId,
    tid: ThreadId,
    status: Status,
) -> ServerResult<()> {
    let denied = || {
        ServerError::access_denied(format!(
            "no delivered event from {:04x}:{:04x}",
            pid, tid
        ))
    };
    let ctx = thread.debug_ctx().ok_or_else(denied)?;
    let event = ctx
        .events()
        .into_iter()
        .find(|event| {
            event.state() == EventState::Sent
                && event.sender().id() == tid
                && event.sender().process().id() == pid
        })
        .ok_or_else(denied)?;

    event.mark_continued(status);
    ctx.unlink(&event);
    event.sender().process().resume();
    wake_up(ctx.as_ref(), 0);
    debug!(pid, tid, %status, "debug event continued");
    Ok(())
}

/// Queue an exception raised by `thread`
///
/// Returns a handle the thread polls with `get_exception_status`, or none
/// when nobody debugs its process.
pub fn queue_exception_event(
    thread: &Rc<Thread>,
    first: bool,
    record: ExceptionRecord,
    context: Vec<u8>,
) -> ServerResult<Handle> {
    let process = thread.process();
    let Some((debugger, ctx)) = active_debugger(process) else {
        return Ok(Handle::NONE);
    };
    let event = alloc_debug_event(
        thread,
        &debugger,
        EventSource::Exception { first, record },
        context,
    )?;
    let handle = process
        .handles()
        .alloc(event.clone(), Access::SYNCHRONIZE)?;
    thread.set_context_event(Some(&event));
    ctx.link(event);
    process.suspend();
    Ok(handle)
}

/// Outcome of a queued exception
///
/// While the debugger has not continued it this fails with `Pending` and the
/// handle stays valid. Once continued the handle is closed and the status
/// comes back, with the register context if it is still current.
pub fn get_exception_status(
    thread: &Rc<Thread>,
    handle: Handle,
) -> ServerResult<(Status, Option<Vec<u8>>)> {
    let handles = thread.process().handles();
    let event = handles.get_typed::<DebugEvent>(handle, Access::empty())?;
    if event.state() != EventState::Continued {
        return Err(ServerError::Pending);
    }
    handles.close(handle)?;
    let current = thread
        .context_event()
        .map_or(false, |current| Rc::ptr_eq(&current, &event));
    let context = if current {
        thread.set_context_event(None);
        Some(event.context())
    } else {
        None
    };
    Ok((event.status(), context))
}

/// Raise a breakpoint exception in `thread`
pub fn break_thread(thread: &Rc<Thread>) -> ServerResult<Option<Rc<DebugEvent>>> {
    let address = thread
        .context_event()
        .and_then(|event| match event.payload() {
            DebugEventPayload::Exception { record, .. } => Some(record.address),
            _ => None,
        })
        .unwrap_or(0);
    let record = ExceptionRecord {
        code: Status::BREAKPOINT.0,
        flags: EXCEPTION_CONTINUABLE,
        address,
        ..Default::default()
    };
    generate_debug_event(thread, EventSource::Exception { first: true, record })
}

/// Break into a process, preferring a thread already inside an exception
pub fn break_process(process: &Rc<Process>) -> ServerResult<()> {
    process.suspend();
    let threads = process.threads();
    let target = threads
        .iter()
        .find(|thread| thread.context_event().is_some())
        .or_else(|| threads.first())
        .cloned();
    let result = match target {
        Some(thread) => break_thread(&thread).map(|_| ()),
        None => Err(ServerError::access_denied(format!(
            "process {:04x} has no thread to break",
            process.id()
        ))),
    };
    process.resume();
    result
}

/// Break into the process behind `handle`
///
/// Returns true when that is the caller's own process, which must raise the
/// breakpoint itself.
pub fn debug_break(thread: &Rc<Thread>, handle: Handle) -> ServerResult<bool> {
    let process = thread
        .process()
        .handles()
        .get_typed::<Process>(handle, PROCESS_SET_INFORMATION)?;
    if Rc::ptr_eq(&process, thread.process()) {
        return Ok(true);
    }
    break_process(&process)?;
    Ok(false)
}

pub fn output_debug_string(
    thread: &Rc<Thread>,
    string: ClientPtr,
    unicode: bool,
    length: u32,
) -> ServerResult<()> {
    generate_debug_event(
        thread,
        EventSource::OutputString {
            string,
            unicode,
            length,
        },
    )
    .map(|_| ())
}

pub fn set_kill_on_exit(thread: &Thread, kill: bool) -> ServerResult<()> {
    let ctx = thread
        .debug_ctx()
        .ok_or_else(|| ServerError::access_denied("thread is not a debugger"))?;
    ctx.set_kill_on_exit(kill);
    Ok(())
}

/// Tear down the debugger side of an exiting thread
///
/// Its debuggees are killed or detached according to the context's policy.
pub fn debug_exit_thread(table: &ProcessTable, thread: &Rc<Thread>) {
    let Some(ctx) = thread.debug_ctx() else {
        return;
    };
    let debuggees: Vec<_> = table
        .running()
        .into_iter()
        .filter(|process| {
            process
                .debugger()
                .map_or(false, |debugger| Rc::ptr_eq(&debugger, thread))
        })
        .collect();

    for process in debuggees {
        if ctx.kill_on_exit() {
            process.set_debugger(None);
            process.set_debug_flag(false);
            info!(pid = process.id(), debugger = thread.id(), "killing debuggee");
            table.kill_process(&process, Status::DEBUGGER_INACTIVE.0);
        } else if let Err(e) = debugger_detach(&process, thread) {
            warn!(pid = process.id(), error = %e, "debuggee detach failed");
        }
    }
    drop(ctx);
    thread.set_debug_ctx(None);
}
