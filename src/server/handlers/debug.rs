/*!
 * Debug Request Handler
 */

use super::{require_caller, RequestHandler};
use crate::core::errors::{ServerError, ServerResult, Status};
use crate::debugger;
use crate::process::Thread;
use crate::server::{Reply, Request, Server};
use std::rc::Rc;

pub struct DebugHandler;

impl RequestHandler for DebugHandler {
    fn handle(
        &self,
        server: &Server,
        caller: Option<&Rc<Thread>>,
        request: &Request,
    ) -> Option<ServerResult<Reply>> {
        let reply_max = server.config().reply_max_size;
        let result = match request {
            Request::WaitDebugEvent { get_handle } => require_caller(caller)
                .and_then(|thread| debugger::wait_debug_event(thread, *get_handle, reply_max))
                .map(Reply::DebugEvent),
            Request::ContinueDebugEvent { pid, tid, status } => {
                require_caller(caller).and_then(|thread| {
                    if *status != Status::DBG_CONTINUE
                        && *status != Status::DBG_EXCEPTION_NOT_HANDLED
                    {
                        return Err(ServerError::invalid_parameter(format!(
                            "bad continue status {}",
                            status
                        )));
                    }
                    debugger::continue_debug_event(thread, *pid, *tid, *status)?;
                    Ok(Reply::Done)
                })
            }
            Request::DebugProcess { pid, attach } => require_caller(caller).and_then(|thread| {
                debugger::debug_process(server.processes(), thread, *pid, *attach)?;
                Ok(Reply::Done)
            }),
            Request::QueueExceptionEvent {
                first,
                record,
                context,
            } => require_caller(caller)
                .and_then(|thread| {
                    debugger::queue_exception_event(thread, *first, record.clone(), context.clone())
                })
                .map(Reply::Handle),
            Request::GetExceptionStatus { handle } => require_caller(caller).and_then(|thread| {
                let (status, context) = debugger::get_exception_status(thread, *handle)?;
                let mut context = context.unwrap_or_default();
                context.truncate(reply_max);
                Ok(Reply::ExceptionStatus { status, context })
            }),
            Request::OutputDebugString {
                string,
                unicode,
                length,
            } => require_caller(caller).and_then(|thread| {
                debugger::output_debug_string(thread, *string, *unicode, *length)?;
                Ok(Reply::Done)
            }),
            Request::DebugBreak { handle } => require_caller(caller)
                .and_then(|thread| debugger::debug_break(thread, *handle))
                .map(|is_self| Reply::DebugBreak { is_self }),
            Request::SetDebuggerKillOnExit { kill_on_exit } => require_caller(caller)
                .and_then(|thread| debugger::set_kill_on_exit(thread, *kill_on_exit))
                .map(|()| Reply::Done),
            _ => return None,
        };
        Some(result)
    }

    fn name(&self) -> &'static str {
        "debug_handler"
    }
}
