/*!
 * File Request Handler
 * Opens, locks, async I/O and completion ports
 */

use super::{handle_fd, require_caller, RequestHandler};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::flags::{Access, FileOptions};
use crate::core::types::Handle;
use crate::fs::{lock_fd, unlock_fd, Async, AsyncKind, File, LockOutcome, OpenParams, Stream};
use crate::object::{Completion, HandleTransaction};
use crate::process::Thread;
use crate::server::{Reply, Request, Server};
use std::path::Path;
use std::rc::Rc;

/// Completion port rights
const COMPLETION_QUERY_STATE: Access = Access::from_bits_retain(0x0001);
const COMPLETION_MODIFY_STATE: Access = Access::from_bits_retain(0x0002);

/// Access an ioctl code asks for, from its two access bits
fn ioctl_access(code: u32) -> Access {
    let mut access = Access::empty();
    let bits = (code >> 14) & 3;
    if bits & 1 != 0 {
        access |= Access::READ_DATA;
    }
    if bits & 2 != 0 {
        access |= Access::WRITE_DATA;
    }
    access
}

pub struct FileHandler;

impl FileHandler {
    fn create_file(
        server: &Server,
        thread: &Thread,
        path: &Path,
        params: &OpenParams,
    ) -> ServerResult<Reply> {
        let file = File::open(server.registry(), path, params)?;
        let handle = thread.process().handles().alloc(file, params.access)?;
        Ok(Reply::Handle(handle))
    }

    fn create_socket_pair(
        server: &Server,
        thread: &Thread,
        options: FileOptions,
    ) -> ServerResult<Reply> {
        let (first, second) = Stream::pair(server.registry(), options)?;
        let access = Access::GENERIC_READ | Access::GENERIC_WRITE;
        let mut tx = HandleTransaction::new(thread.process().handles());
        let first = tx.alloc(first, access)?;
        let second = tx.alloc(second, access)?;
        tx.commit();
        Ok(Reply::SocketPair { first, second })
    }

    fn lock_file(
        thread: &Thread,
        handle: Handle,
        offset: u64,
        count: u64,
        shared: bool,
        wait: bool,
    ) -> ServerResult<Reply> {
        let fd = handle_fd(thread, handle, Access::empty())?;
        let overlapped = !fd.options().intersects(FileOptions::SYNCHRONOUS);
        let outcome = lock_fd(&fd, thread.process(), offset, count, shared, wait)?;
        let reply = match outcome {
            LockOutcome::Granted => Reply::Lock {
                handle: Handle::NONE,
                pending: false,
                overlapped,
            },
            LockOutcome::Pending(Some(lock)) => Reply::Lock {
                handle: thread.process().handles().alloc(lock, Access::SYNCHRONIZE)?,
                pending: true,
                overlapped,
            },
            LockOutcome::Pending(None) => Reply::Lock {
                handle: Handle::NONE,
                pending: true,
                overlapped,
            },
        };
        Ok(reply)
    }
}

impl RequestHandler for FileHandler {
    fn handle(
        &self,
        server: &Server,
        caller: Option<&Rc<Thread>>,
        request: &Request,
    ) -> Option<ServerResult<Reply>> {
        let result = match request {
            Request::CloseHandle { handle } => require_caller(caller)
                .and_then(|thread| thread.process().handles().close(*handle))
                .map(|()| Reply::Done),
            Request::CreateFile { path, params } => require_caller(caller)
                .and_then(|thread| Self::create_file(server, thread, path, params)),
            Request::CreateSocketPair { options } => require_caller(caller)
                .and_then(|thread| Self::create_socket_pair(server, thread, *options)),
            Request::GetHandleFd { handle } => require_caller(caller).and_then(|thread| {
                let fd = handle_fd(thread, *handle, Access::empty())?;
                Ok(Reply::HandleFd {
                    fd: fd.dup_unix_fd()?,
                    kind: fd.get_fd_type(),
                    removable: fd.is_removable(),
                    options: fd.options(),
                    access: thread.process().handles().access(*handle)?,
                })
            }),
            Request::FlushFile { handle } => require_caller(caller).and_then(|thread| {
                let fd = handle_fd(thread, *handle, Access::WRITE_DATA)?;
                let handle = match fd.flush()? {
                    Some(event) => thread.process().handles().alloc(event, Access::SYNCHRONIZE)?,
                    None => Handle::NONE,
                };
                Ok(Reply::Handle(handle))
            }),
            Request::LockFile {
                handle,
                offset,
                count,
                shared,
                wait,
            } => require_caller(caller).and_then(|thread| {
                Self::lock_file(thread, *handle, *offset, *count, *shared, *wait)
            }),
            Request::UnlockFile {
                handle,
                offset,
                count,
            } => require_caller(caller).and_then(|thread| {
                let fd = handle_fd(thread, *handle, Access::empty())?;
                unlock_fd(&fd, *offset, *count)?;
                Ok(Reply::Done)
            }),
            Request::Ioctl {
                handle,
                code,
                params,
                data,
            } => require_caller(caller).and_then(|thread| {
                let fd = handle_fd(thread, *handle, ioctl_access(*code))?;
                let wait = match fd.ioctl(*code, params, data)? {
                    Some(async_) => thread.process().handles().alloc(async_, Access::SYNCHRONIZE)?,
                    None => Handle::NONE,
                };
                Ok(Reply::Ioctl {
                    wait,
                    options: fd.options(),
                })
            }),
            Request::RegisterAsync {
                handle,
                kind,
                params,
                count,
            } => require_caller(caller).and_then(|thread| {
                let access = match kind {
                    AsyncKind::Read => Access::READ_DATA,
                    AsyncKind::Write => Access::WRITE_DATA,
                    AsyncKind::Wait => {
                        return Err(ServerError::invalid_parameter(
                            "only reads and writes can be registered",
                        ))
                    }
                };
                let fd = handle_fd(thread, *handle, access)?;
                let async_ = fd.register_async(*kind, *params, *count)?;
                let handle = thread
                    .process()
                    .handles()
                    .alloc(async_, Access::SYNCHRONIZE)?;
                Ok(Reply::Handle(handle))
            }),
            Request::SetAsyncResult {
                handle,
                status,
                information,
            } => require_caller(caller).and_then(|thread| {
                let async_ = thread
                    .process()
                    .handles()
                    .get_typed::<Async>(*handle, Access::empty())?;
                async_.set_result(*status, *information);
                Ok(Reply::Done)
            }),
            Request::CancelAsync { handle } => require_caller(caller).and_then(|thread| {
                handle_fd(thread, *handle, Access::empty())?.cancel_async();
                Ok(Reply::Done)
            }),
            Request::CreateCompletion => require_caller(caller).and_then(|thread| {
                let access = Access::STANDARD_RIGHTS_ALL | COMPLETION_QUERY_STATE | COMPLETION_MODIFY_STATE;
                let handle = thread.process().handles().alloc(Completion::new(), access)?;
                Ok(Reply::Handle(handle))
            }),
            Request::RemoveCompletion { handle } => require_caller(caller).and_then(|thread| {
                let completion = thread
                    .process()
                    .handles()
                    .get_typed::<Completion>(*handle, COMPLETION_MODIFY_STATE)?;
                completion
                    .remove()
                    .map(Reply::Completion)
                    .ok_or(ServerError::Pending)
            }),
            Request::SetCompletionInfo {
                handle,
                completion,
                key,
            } => require_caller(caller).and_then(|thread| {
                let fd = handle_fd(thread, *handle, Access::empty())?;
                let completion = thread
                    .process()
                    .handles()
                    .get_typed::<Completion>(*completion, COMPLETION_MODIFY_STATE)?;
                fd.set_completion(completion, *key)?;
                Ok(Reply::Done)
            }),
            Request::AddFdCompletion {
                handle,
                cvalue,
                status,
                information,
            } => require_caller(caller).and_then(|thread| {
                handle_fd(thread, *handle, Access::empty())?.add_completion(
                    *cvalue,
                    *status,
                    *information,
                );
                Ok(Reply::Done)
            }),
            _ => return None,
        };
        Some(result)
    }

    fn name(&self) -> &'static str {
        "file_handler"
    }
}
