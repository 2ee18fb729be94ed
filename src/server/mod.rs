/*!
 * Request Dispatcher
 *
 * Owns the reactor, the file registry and the process table, and routes each
 * request to the handler that understands it. Everything here lives on the
 * reactor thread; other threads go through `ServerHandle`.
 */

pub mod actor;
pub mod handlers;
pub mod request;

pub use actor::ServerHandle;
pub use handlers::{DebugHandler, FileHandler, ProcessHandler, RequestHandler};
pub use request::{Reply, Request};

use crate::core::config::ServerConfig;
use crate::core::errors::{ServerError, ServerResult};
use crate::core::types::ThreadId;
use crate::fs::FileRegistry;
use crate::monitoring::RequestSpan;
use crate::process::ProcessTable;
use crate::reactor::Reactor;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info};

pub struct Server {
    config: ServerConfig,
    reactor: Rc<Reactor>,
    registry: Rc<FileRegistry>,
    processes: ProcessTable,
    handlers: Vec<Box<dyn RequestHandler>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let reactor = Reactor::with_config(&config);
        Self::with_reactor(config, reactor)
    }

    /// Build a server around an existing reactor
    pub fn with_reactor(config: ServerConfig, reactor: Rc<Reactor>) -> Self {
        let registry = FileRegistry::new(Rc::clone(&reactor));
        let processes = ProcessTable::new(config.max_handles, config.kill_on_exit_default);
        info!(
            backend = ?reactor.backend_kind(),
            max_handles = config.max_handles,
            "server initialized"
        );
        Self {
            config,
            reactor,
            registry,
            processes,
            handlers: vec![
                Box::new(ProcessHandler),
                Box::new(FileHandler),
                Box::new(DebugHandler),
            ],
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    pub fn registry(&self) -> &Rc<FileRegistry> {
        &self.registry
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Execute one request on behalf of thread `tid`
    ///
    /// Only `NewProcess` may come from an unknown thread; it then bootstraps
    /// a process nobody holds handles to.
    pub fn dispatch(&self, tid: ThreadId, request: Request) -> ServerResult<Reply> {
        let span = RequestSpan::new(
            request.name(),
            tid,
            Duration::from_millis(self.config.slow_request_ms),
        );
        let _entered = span.enter();

        let caller = self.processes.get_thread(tid);
        let result = self
            .handlers
            .iter()
            .find_map(|handler| {
                let result = handler.handle(self, caller.as_ref(), &request)?;
                debug!(handler = handler.name(), "request routed");
                Some(result)
            })
            .unwrap_or_else(|| {
                Err(ServerError::NotSupported(format!(
                    "no handler for {}",
                    request.name()
                )))
            });
        if let Err(e) = &result {
            debug!(request = request.name(), tid, error = %e, "request failed");
        }
        span.record_result(&result);
        result
    }
}
