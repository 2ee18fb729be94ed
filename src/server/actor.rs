/*!
 * Server Actor
 *
 * Runs the single-threaded server on its own OS thread. Other threads send
 * requests over a flume channel and poke a socket the reactor watches; the
 * reactor thread drains the channel between poll iterations.
 */

use super::{Reply, Request, Server};
use crate::core::config::ServerConfig;
use crate::core::errors::{ServerError, ServerResult, Status};
use crate::core::flags::FileOptions;
use crate::core::types::ThreadId;
use crate::fs::{create_anonymous_fd, default_get_poll_events, Fd, FdOps, FdType};
use crate::reactor::Interest;
use anyhow::Context;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

enum Message {
    Request {
        tid: ThreadId,
        request: Request,
        reply: flume::Sender<ServerResult<Reply>>,
    },
    Shutdown,
}

fn server_gone() -> ServerError {
    ServerError::Io {
        status: Status::UNSUCCESSFUL,
        message: "server thread has stopped".into(),
    }
}

/// Cloneable, thread-safe entry point to a running server
#[derive(Clone)]
pub struct ServerHandle {
    tx: flume::Sender<Message>,
    waker: Arc<UnixStream>,
}

impl ServerHandle {
    /// Start a server thread
    pub fn spawn(config: ServerConfig) -> ServerResult<(Self, JoinHandle<anyhow::Result<()>>)> {
        let (waker, wake_rx) = UnixStream::pair()?;
        waker.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        let (tx, rx) = flume::unbounded();

        let join = thread::Builder::new()
            .name("objbroker-reactor".into())
            .spawn(move || run_server(config, rx, wake_rx))?;

        Ok((
            Self {
                tx,
                waker: Arc::new(waker),
            },
            join,
        ))
    }

    fn poke(&self) {
        match (&*self.waker).write(&[1]) {
            Ok(_) => {}
            // a full buffer already guarantees a wakeup
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "server wake failed"),
        }
    }

    fn send(&self, tid: ThreadId, request: Request) -> ServerResult<flume::Receiver<ServerResult<Reply>>> {
        let (reply, rx) = flume::bounded(1);
        self.tx
            .send(Message::Request {
                tid,
                request,
                reply,
            })
            .map_err(|_| server_gone())?;
        self.poke();
        Ok(rx)
    }

    /// Execute a request and block for the reply
    pub fn call(&self, tid: ThreadId, request: Request) -> ServerResult<Reply> {
        self.send(tid, request)?.recv().map_err(|_| server_gone())?
    }

    /// Execute a request without blocking the async runtime
    pub async fn call_async(&self, tid: ThreadId, request: Request) -> ServerResult<Reply> {
        let rx = self.send(tid, request)?;
        rx.recv_async().await.map_err(|_| server_gone())?
    }

    /// Ask the server thread to stop after the requests already queued
    pub fn shutdown(&self) {
        if self.tx.send(Message::Shutdown).is_ok() {
            self.poke();
        }
    }
}

/// Reactor-side end of the wake socket
struct WakerOps {
    rx: flume::Receiver<Message>,
    server: Weak<Server>,
    reader: UnixStream,
}

impl WakerOps {
    fn drain_socket(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }

    fn drain_requests(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        loop {
            match self.rx.try_recv() {
                Ok(Message::Request {
                    tid,
                    request,
                    reply,
                }) => {
                    let result = server.dispatch(tid, request);
                    if reply.send(result).is_err() {
                        debug!(tid, "requester left before the reply");
                    }
                }
                Ok(Message::Shutdown) => {
                    info!("shutdown requested");
                    server.reactor().stop();
                    return;
                }
                Err(flume::TryRecvError::Empty) => return,
                Err(flume::TryRecvError::Disconnected) => {
                    info!("all server handles dropped");
                    server.reactor().stop();
                    return;
                }
            }
        }
    }
}

impl FdOps for WakerOps {
    fn get_fd_type(&self, _fd: &Fd) -> FdType {
        FdType::Socket
    }

    fn get_poll_events(&self, fd: &Fd) -> Interest {
        default_get_poll_events(fd) | Interest::IN
    }

    fn poll_event(&self, fd: &Rc<Fd>, events: Interest) {
        if events.intersects(Interest::ERR | Interest::HUP) {
            warn!("wake socket closed");
            fd.set_events(None);
            if let Some(server) = self.server.upgrade() {
                server.reactor().stop();
            }
            return;
        }
        self.drain_socket();
        self.drain_requests();
    }
}

fn run_server(
    config: ServerConfig,
    rx: flume::Receiver<Message>,
    wake_rx: UnixStream,
) -> anyhow::Result<()> {
    let server = Rc::new(Server::new(config));
    let reader = wake_rx.try_clone().context("duplicating wake socket")?;
    let ops = WakerOps {
        rx,
        server: Rc::downgrade(&server),
        reader,
    };
    let waker = create_anonymous_fd(
        server.registry(),
        Box::new(ops),
        wake_rx.into(),
        FileOptions::empty(),
    )
    .map_err(|e| anyhow::anyhow!("registering wake socket: {}", e))?;
    waker.set_events(Some(Interest::IN));

    info!(backend = ?server.reactor().backend_kind(), "server thread running");
    let result = server.reactor().run().context("reactor loop failed");
    drop(waker);
    info!("server thread finished");
    result
}
