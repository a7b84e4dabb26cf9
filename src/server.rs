// src/server.rs
use crate::conn::Connection;
use crate::error::{ServerError, ServerResult};
use crate::handler::{self, Handler};
use crate::metrics::ServerMetrics;
use crate::parser;
use crate::pool::ThreadPool;
use crate::registry::Registry;
use crate::response::{self, StatusCode};
use crate::syscalls::{self, Epoll};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Poll interval: short enough that clearing the running flag stops the
/// reactor promptly without a dedicated wakeup channel.
const EPOLL_TIMEOUT_MS: i32 = 100;
const MAX_EVENTS: usize = 1024;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

const BAD_REQUEST_PAGE: &[u8] =
    b"<html><body><h1>400 Bad Request</h1><p>The HTTP request is malformed.</p></body></html>";
const NOT_FOUND_PAGE: &[u8] =
    b"<html><body><h1>404 Not Found</h1><p>The requested resource does not exist.</p></body></html>";
const METHOD_NOT_ALLOWED_PAGE: &[u8] =
    b"<html><body><h1>405 Method Not Allowed</h1><p>The HTTP method is not supported.</p></body></html>";
const INTERNAL_ERROR_PAGE: &[u8] =
    b"<html><body><h1>500 Internal Server Error</h1><p>An internal error occurred.</p></body></html>";

/// Event-driven HTTP/1.1 server: one reactor thread multiplexing all
/// sockets through epoll, a fixed worker pool running request handling.
///
/// ```no_run
/// use presto::Server;
///
/// let mut server = Server::bind("0.0.0.0:8080").workers(4);
/// server.start().expect("startup failed");
/// // ...
/// server.stop();
/// ```
pub struct Server {
    addr: String,
    workers: usize,
    max_connections: usize,
    handler: Handler,
    core: Option<Arc<Core>>,
    reactor: Option<JoinHandle<()>>,
}

struct Core {
    listen_fd: RawFd,
    local_addr: SocketAddr,
    epoll: Epoll,
    registry: Registry,
    pool: ThreadPool,
    running: AtomicBool,
    handler: Handler,
    metrics: ServerMetrics,
}

impl Server {
    /// Builder entry point. No sockets are touched until `start`.
    pub fn bind(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            workers: num_cpus::get(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handler: handler::welcome,
            core: None,
            reactor: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = handler;
        self
    }

    /// Create the listening socket and the epoll instance, then launch the
    /// reactor thread. Startup failures tear down whatever was created and
    /// surface as an error. Calling `start` on a running server is a no-op.
    pub fn start(&mut self) -> ServerResult<()> {
        if self.core.is_some() {
            return Ok(());
        }

        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|_| ServerError::InvalidAddr(self.addr.clone()))?;

        let listen_fd = syscalls::create_listen_socket(&addr)?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(local) => local,
            Err(err) => {
                syscalls::close(listen_fd);
                return Err(err.into());
            }
        };
        let epoll = match Epoll::new() {
            Ok(epoll) => epoll,
            Err(err) => {
                syscalls::close(listen_fd);
                return Err(err);
            }
        };
        if let Err(err) = epoll.register_read(listen_fd) {
            syscalls::close(listen_fd);
            return Err(err);
        }

        let core = Arc::new(Core {
            listen_fd,
            local_addr,
            epoll,
            registry: Registry::new(self.max_connections),
            pool: ThreadPool::new(self.workers),
            running: AtomicBool::new(true),
            handler: self.handler,
            metrics: ServerMetrics::new(),
        });

        let reactor_core = Arc::clone(&core);
        let reactor = thread::Builder::new()
            .name("presto-reactor".to_string())
            .spawn(move || reactor_core.event_loop())
            .map_err(ServerError::Io)?;

        info!(
            addr = %local_addr,
            workers = self.workers,
            max_connections = self.max_connections,
            "server started"
        );
        self.core = Some(core);
        self.reactor = Some(reactor);
        Ok(())
    }

    /// Stop the reactor, close every registered connection, drain and join
    /// the worker pool. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        core.running.store(false, Ordering::Release);
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
        core.close_all();
        core.pool.shutdown();
        info!(
            requests = core.metrics.requests(),
            bytes_sent = core.metrics.bytes_sent(),
            "server stopped"
        );
        // dropping the last Arc closes the listen fd and the epoll fd
    }

    /// Actual bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.as_ref().map(|core| core.local_addr)
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.registry.len())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        syscalls::close(self.listen_fd);
    }
}

impl Core {
    /// Reactor loop, single thread. Listening-socket events trigger an
    /// accept storm inline; client events are handed to the pool. Client fds
    /// are armed one-shot and only the worker re-arms them, so a given fd is
    /// never handled by two workers at once.
    fn event_loop(self: Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let client_ready = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;

        while self.running.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, EPOLL_TIMEOUT_MS) {
                Ok(n) => n,
                Err(err) => {
                    error!("epoll_wait failed: {err}");
                    break;
                }
            };

            for event in &events[..n] {
                let fd = event.u64 as RawFd;
                if fd == self.listen_fd {
                    self.accept_pending();
                } else if event.events & client_ready != 0 {
                    let core = Arc::clone(&self);
                    self.pool.execute(move || core.read_task(fd));
                }
            }
        }
        debug!("reactor exiting");
    }

    /// Drain the accept queue (edge-triggered: stop only on would-block).
    fn accept_pending(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    let conn = Connection::new(fd, peer);
                    if self.registry.try_insert(conn).is_err() {
                        // at capacity; dropping the rejected record closed the fd
                        debug!(%peer, "connection rejected: registry full");
                        continue;
                    }
                    self.metrics.conn_opened();
                    if let Err(err) = self.epoll.register_oneshot(fd) {
                        warn!(fd, %peer, "client registration failed: {err}");
                        self.close_connection(fd);
                        continue;
                    }
                    debug!(fd, %peer, "connection accepted");
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// Worker entry: read whatever the socket has, look for a complete head,
    /// and either process it, wait for more (re-arm) or give up (close).
    fn read_task(&self, fd: RawFd) {
        let Some(conn) = self.registry.lookup(fd) else {
            return;
        };
        // uncontended: one-shot arming guarantees a single task per fd
        let mut conn = conn.lock().expect("connection mutex poisoned");

        match syscalls::recv(fd, conn.spare_mut()) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                drop(conn);
                self.rearm(fd);
            }
            Err(err) => {
                debug!(fd, "recv failed: {err}");
                drop(conn);
                self.close_connection(fd);
            }
            Ok(0) => {
                // peer closed
                drop(conn);
                self.close_connection(fd);
            }
            Ok(n) => {
                conn.advance(n);
                if let Some(head_end) = conn.head_end() {
                    let head = conn.buffered()[..head_end].to_vec();
                    drop(conn);
                    self.process_request(fd, &head);
                } else if conn.is_full() {
                    debug!(fd, "request head exceeds buffer, closing");
                    drop(conn);
                    self.close_connection(fd);
                } else {
                    drop(conn);
                    self.rearm(fd);
                }
            }
        }
    }

    fn rearm(&self, fd: RawFd) {
        if let Err(err) = self.epoll.rearm(fd) {
            warn!(fd, "re-arm failed: {err}");
            self.close_connection(fd);
        }
    }

    /// Decode, call the application seam, classify, respond.
    fn process_request(&self, fd: RawFd, head: &[u8]) {
        let request = match parser::parse_request(head) {
            Ok(request) => request,
            Err(err) => {
                debug!(fd, "rejecting request: {err}");
                self.respond_and_close(fd, StatusCode::BadRequest, BAD_REQUEST_PAGE);
                return;
            }
        };
        self.metrics.inc_request();

        let handler = self.handler;
        let body = match panic::catch_unwind(AssertUnwindSafe(|| handler(&request))) {
            Ok(body) => body,
            Err(_) => {
                error!(fd, method = %request.method, path = %request.path, "handler panicked");
                self.respond_and_close(fd, StatusCode::InternalError, INTERNAL_ERROR_PAGE);
                return;
            }
        };

        let (status, body) = if body.is_empty() {
            if request.method == "GET" {
                (StatusCode::NotFound, NOT_FOUND_PAGE.to_vec())
            } else {
                (StatusCode::BadRequest, METHOD_NOT_ALLOWED_PAGE.to_vec())
            }
        } else {
            (StatusCode::Ok, body)
        };

        // error responses always close: the derived keep-alive only survives
        // a 200
        let keep_alive = request.keep_alive && status == StatusCode::Ok;

        debug!(
            fd,
            method = %request.method,
            path = %request.path,
            status = status.code(),
            keep_alive,
            "request served"
        );

        let wire = response::build(status, &body, keep_alive);
        if let Err(err) = self.transmit(fd, &wire) {
            debug!(fd, "send failed: {err}");
            self.close_connection(fd);
            return;
        }
        self.finish_request(fd, keep_alive);
    }

    fn respond_and_close(&self, fd: RawFd, status: StatusCode, page: &[u8]) {
        let wire = response::build(status, page, false);
        if let Err(err) = self.transmit(fd, &wire) {
            debug!(fd, "send failed: {err}");
        }
        self.close_connection(fd);
    }

    /// Full-write loop. Would-block busy-retries: response bodies are small
    /// enough for the socket send buffer to absorb them, and shutdown breaks
    /// the loop via the running flag.
    fn transmit(&self, fd: RawFd, wire: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < wire.len() {
            match syscalls::send(fd, &wire[sent..]) {
                Ok(n) => sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !self.running.load(Ordering::Acquire) {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        self.metrics.add_bytes(sent);
        Ok(())
    }

    /// After a successful send: reset and re-arm a kept-alive connection,
    /// close anything else. Runs under the registry mutex so membership and
    /// epoll registration stay consistent.
    fn finish_request(&self, fd: RawFd, keep_alive: bool) {
        let mut conns = self.registry.lock();
        let Some(entry) = conns.get(&fd) else {
            return;
        };

        let mut record = entry.lock().expect("connection mutex poisoned");
        record.set_keep_alive(keep_alive);
        if keep_alive {
            record.reset();
            drop(record);
            if self.epoll.rearm(fd).is_ok() {
                return;
            }
            warn!(fd, "re-arm after response failed, closing");
        } else {
            drop(record);
        }

        self.epoll.deregister(fd).ok();
        if conns.remove(&fd).is_some() {
            self.metrics.conn_closed();
        }
    }

    /// Deregister and erase; dropping the record closes the fd. Calling this
    /// for an fd that is already gone is a no-op.
    fn close_connection(&self, fd: RawFd) {
        let mut conns = self.registry.lock();
        // the fd may already be absent from epoll; errors are ignored
        self.epoll.deregister(fd).ok();
        if conns.remove(&fd).is_some() {
            self.metrics.conn_closed();
        }
    }

    /// Shutdown path: tear down every registered connection at once.
    fn close_all(&self) {
        let mut conns = self.registry.lock();
        for fd in conns.keys() {
            self.epoll.deregister(*fd).ok();
        }
        for _ in 0..conns.len() {
            self.metrics.conn_closed();
        }
        conns.clear();
    }
}
