/*!
 * Request and Reply Types
 * The client-facing surface of the broker, one variant per request
 */

use crate::core::errors::Status;
use crate::core::flags::{Access, FileOptions};
use crate::core::types::{ClientPtr, FilePos, Handle, ModuleInfo, ProcessId, ThreadId};
use crate::debugger::{DebugWait, ExceptionRecord};
use crate::fs::{AsyncKind, AsyncParams, FdType, OpenParams};
use crate::object::CompletionMsg;
use serde::{Deserialize, Serialize};
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

/// Requests a client thread can make
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum Request {
    // ========================================================================
    // Processes and threads
    // ========================================================================
    /// Start a process with one thread; `debug` makes the caller its debugger
    NewProcess {
        debug: bool,
        teb: ClientPtr,
        entry: ClientPtr,
    },
    NewThread {
        teb: ClientPtr,
        entry: ClientPtr,
    },
    InitProcessDone {
        module: ModuleInfo,
        exe_file: Handle,
        entry: ClientPtr,
    },
    LoadDll {
        module: ModuleInfo,
        file: Handle,
    },
    UnloadDll {
        base: ClientPtr,
    },
    ExitThread {
        exit_code: u32,
    },
    TerminateProcess {
        handle: Handle,
        exit_code: u32,
    },
    SetConsoleRenderer {
        renderer: Option<ProcessId>,
    },

    // ========================================================================
    // Handles and files
    // ========================================================================
    CloseHandle {
        handle: Handle,
    },
    CreateFile {
        path: PathBuf,
        params: OpenParams,
    },
    CreateSocketPair {
        #[serde(with = "crate::core::flags::options_bits")]
        options: FileOptions,
    },
    GetHandleFd {
        handle: Handle,
    },
    FlushFile {
        handle: Handle,
    },
    LockFile {
        handle: Handle,
        offset: FilePos,
        count: FilePos,
        shared: bool,
        wait: bool,
    },
    UnlockFile {
        handle: Handle,
        offset: FilePos,
        count: FilePos,
    },

    // ========================================================================
    // Async I/O and completion ports
    // ========================================================================
    Ioctl {
        handle: Handle,
        code: u32,
        params: AsyncParams,
        data: Vec<u8>,
    },
    RegisterAsync {
        handle: Handle,
        kind: AsyncKind,
        params: AsyncParams,
        count: u32,
    },
    SetAsyncResult {
        handle: Handle,
        status: Status,
        information: u64,
    },
    CancelAsync {
        handle: Handle,
    },
    CreateCompletion,
    RemoveCompletion {
        handle: Handle,
    },
    SetCompletionInfo {
        handle: Handle,
        completion: Handle,
        key: u64,
    },
    AddFdCompletion {
        handle: Handle,
        cvalue: u64,
        status: Status,
        information: u64,
    },

    // ========================================================================
    // Debugger
    // ========================================================================
    WaitDebugEvent {
        get_handle: bool,
    },
    ContinueDebugEvent {
        pid: ProcessId,
        tid: ThreadId,
        status: Status,
    },
    DebugProcess {
        pid: ProcessId,
        attach: bool,
    },
    QueueExceptionEvent {
        first: bool,
        record: ExceptionRecord,
        context: Vec<u8>,
    },
    GetExceptionStatus {
        handle: Handle,
    },
    OutputDebugString {
        string: ClientPtr,
        unicode: bool,
        length: u32,
    },
    DebugBreak {
        handle: Handle,
    },
    SetDebuggerKillOnExit {
        kill_on_exit: bool,
    },
}

impl Request {
    /// Request name for logs and spans
    pub fn name(&self) -> &'static str {
        match self {
            Request::NewProcess { .. } => "new_process",
            Request::NewThread { .. } => "new_thread",
            Request::InitProcessDone { .. } => "init_process_done",
            Request::LoadDll { .. } => "load_dll",
            Request::UnloadDll { .. } => "unload_dll",
            Request::ExitThread { .. } => "exit_thread",
            Request::TerminateProcess { .. } => "terminate_process",
            Request::SetConsoleRenderer { .. } => "set_console_renderer",
            Request::CloseHandle { .. } => "close_handle",
            Request::CreateFile { .. } => "create_file",
            Request::CreateSocketPair { .. } => "create_socket_pair",
            Request::GetHandleFd { .. } => "get_handle_fd",
            Request::FlushFile { .. } => "flush_file",
            Request::LockFile { .. } => "lock_file",
            Request::UnlockFile { .. } => "unlock_file",
            Request::Ioctl { .. } => "ioctl",
            Request::RegisterAsync { .. } => "register_async",
            Request::SetAsyncResult { .. } => "set_async_result",
            Request::CancelAsync { .. } => "cancel_async",
            Request::CreateCompletion => "create_completion",
            Request::RemoveCompletion { .. } => "remove_completion",
            Request::SetCompletionInfo { .. } => "set_completion_info",
            Request::AddFdCompletion { .. } => "add_fd_completion",
            Request::WaitDebugEvent { .. } => "wait_debug_event",
            Request::ContinueDebugEvent { .. } => "continue_debug_event",
            Request::DebugProcess { .. } => "debug_process",
            Request::QueueExceptionEvent { .. } => "queue_exception_event",
            Request::GetExceptionStatus { .. } => "get_exception_status",
            Request::OutputDebugString { .. } => "output_debug_string",
            Request::DebugBreak { .. } => "debug_break",
            Request::SetDebuggerKillOnExit { .. } => "set_debugger_kill_on_exit",
        }
    }
}

/// Replies; `HandleFd` carries a descriptor, so replies stay in-process
#[derive(Debug)]
pub enum Reply {
    Done,
    NewProcess {
        pid: ProcessId,
        tid: ThreadId,
        /// Handles in the caller's process, none for a bootstrap request
        process: Handle,
        thread: Handle,
    },
    NewThread {
        tid: ThreadId,
        handle: Handle,
    },
    /// A new handle, or `Handle::NONE` when there is nothing to wait on
    Handle(Handle),
    SocketPair {
        first: Handle,
        second: Handle,
    },
    /// Descriptor behind a handle, with what the client needs to use it
    HandleFd {
        fd: OwnedFd,
        kind: FdType,
        removable: bool,
        options: FileOptions,
        /// Rights granted to the handle
        access: Access,
    },
    Ioctl {
        /// Async to wait on, none when the ioctl finished inline
        wait: Handle,
        options: FileOptions,
    },
    Lock {
        /// Lock to wait on when the request is pending
        handle: Handle,
        pending: bool,
        overlapped: bool,
    },
    Completion(CompletionMsg),
    DebugEvent(DebugWait),
    ExceptionStatus {
        status: Status,
        context: Vec<u8>,
    },
    DebugBreak {
        is_self: bool,
    },
}
