/*!
 * Request Handlers
 * One handler per request family; the dispatcher asks each in turn
 */

mod debug;
mod file;
mod process;

pub use debug::DebugHandler;
pub use file::FileHandler;
pub use process::ProcessHandler;

use super::{Reply, Request, Server};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::flags::Access;
use crate::core::types::Handle;
use crate::fs::Fd;
use crate::process::Thread;
use std::rc::Rc;

/// Handler for one family of requests
pub trait RequestHandler {
    /// Handle the request, or return None if it belongs to another handler
    fn handle(
        &self,
        server: &Server,
        caller: Option<&Rc<Thread>>,
        request: &Request,
    ) -> Option<ServerResult<Reply>>;

    /// Handler name for logging
    fn name(&self) -> &'static str;
}

fn require_caller(caller: Option<&Rc<Thread>>) -> ServerResult<&Rc<Thread>> {
    caller.ok_or_else(|| ServerError::invalid_parameter("request from an unknown thread"))
}

/// Fd behind a handle in the caller's process
fn handle_fd(thread: &Thread, handle: Handle, access: Access) -> ServerResult<Rc<Fd>> {
    thread.process().handles().get(handle, access)?.get_fd()
}
