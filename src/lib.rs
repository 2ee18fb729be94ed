/*!
 * objbroker
 * Object broker for a Windows compatibility layer: handles, files, locks,
 * async I/O, processes and the debugger protocol on one reactor thread
 */

pub mod core;
pub mod debugger;
pub mod fs;
pub mod monitoring;
pub mod object;
pub mod process;
pub mod reactor;
pub mod server;

// Re-exports
pub use crate::core::config::ServerConfig;
pub use crate::core::errors::{ServerError, ServerResult, Status};
pub use crate::core::types::{Handle, ProcessId, ThreadId};
pub use monitoring::{init_tracing, RequestSpan};
pub use object::{Object, ObjectType};
pub use process::{Process, ProcessTable, Thread};
pub use reactor::{Interest, Reactor};
pub use server::{Reply, Request, Server, ServerHandle};
