//! Completion engine and the public server handle.
//!
//! The server keeps a standing pool of accept operations on its listener.
//! Each accept completion becomes a [`Session`], which lives in the registry
//! until the peer disconnects, a transport error occurs, or the server stops.

use crate::error::StartError;
use crate::runtime::buffer::Buffer;
use crate::runtime::context::{
    Accepted, IoContext, OpKind, Operation, SocketContextPool, SocketId, DEFAULT_RECV_BUFFER_SIZE,
};
use crate::runtime::port::{CompletionPort, Rejected, SocketHandle, Submitter};
use crate::runtime::registry::SessionRegistry;
use crate::runtime::session::{Callbacks, Session};
use crate::runtime::stats::{ResourceStats, StatsSnapshot};
use crate::runtime::worker::{classify, ErrorClass, WorkerPool};
use mio::net::TcpListener;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Worker threads sharing the completion queue.
pub const DEFAULT_WORKERS: usize = 4;

/// Accept operations kept outstanding on the listener.
pub const MAX_POST_ACCEPT: usize = 10;

/// Listen backlog passed to `listen(2)`.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Tunables fixed for the lifetime of a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub workers: usize,
    pub accept_pool_size: usize,
    /// Transfer unit of each receive.
    pub recv_buffer_size: usize,
    /// `SO_SNDBUF` for accepted connections; the OS default if `None`.
    pub send_buffer_size: Option<usize>,
    pub backlog: i32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            accept_pool_size: MAX_POST_ACCEPT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            send_buffer_size: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Server lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

/// Shared state of a running server, referenced by every worker.
pub(crate) struct Engine {
    port: CompletionPort,
    submitter: Submitter,
    registry: SessionRegistry,
    listener: SocketContextPool,
    callbacks: Arc<Callbacks>,
    stats: Arc<ResourceStats>,
    options: ServerOptions,
    outstanding_accepts: AtomicUsize,
    accepting: AtomicBool,
}

impl Engine {
    fn new(
        port: CompletionPort,
        listener: SocketHandle,
        callbacks: Arc<Callbacks>,
        stats: Arc<ResourceStats>,
        options: ServerOptions,
    ) -> Self {
        Self {
            submitter: port.submitter(),
            port,
            registry: SessionRegistry::new(),
            listener: SocketContextPool::new(listener, Arc::clone(&stats)),
            callbacks,
            stats,
            options,
            outstanding_accepts: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    pub(crate) fn port(&self) -> &CompletionPort {
        &self.port
    }

    pub(crate) fn session(&self, id: SocketId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    /// Remove a session after a disconnect or transport error and close its
    /// socket, even if the application still holds the session.
    pub(crate) fn drop_session(&self, id: SocketId) {
        if let Some(session) = self.registry.remove(id) {
            session.close();
            debug!(socket = %id, remote = session.remote_addr(), "Session closed");
            session.handle_disconnected();
        }
    }

    /// Return the context of a completion that arrived after its session
    /// was removed. Nothing to do if the session is already gone.
    pub(crate) fn release_orphan(&self, ctx: IoContext) {
        if let Some(session) = self.registry.get_retired(ctx.socket()) {
            session.release_context(ctx);
        }
    }

    /// Post `ctx` again unchanged.
    pub(crate) fn repost(&self, ctx: IoContext) {
        if let Err(Rejected(ctx)) = self.submitter.post(ctx) {
            if ctx.kind() == OpKind::Accept {
                self.outstanding_accepts.fetch_sub(1, Ordering::AcqRel);
                self.listener.remove_context(&ctx);
            } else if let Some(session) = self.registry.get(ctx.socket()) {
                session.release_context(ctx);
            } else {
                self.release_orphan(ctx);
            }
        }
    }

    /// Post the initial accept pool. Returns how many were posted.
    fn prime_accepts(&self) -> usize {
        let mut posted = 0;
        for _ in 0..self.options.accept_pool_size {
            let ctx = self.listener.new_context(Operation::Accept { accepted: None });
            match self.post_accept(ctx) {
                Ok(()) => posted += 1,
                Err(Rejected(ctx)) => {
                    self.listener.remove_context(&ctx);
                    break;
                }
            }
        }
        posted
    }

    fn post_accept(&self, ctx: IoContext) -> Result<(), Rejected> {
        self.post_accept_with(ctx, |ctx| self.submitter.post(ctx))
    }

    fn post_accept_with(
        &self,
        ctx: IoContext,
        post: impl Fn(IoContext) -> Result<(), Rejected>,
    ) -> Result<(), Rejected> {
        // Counted before posting: a worker may finish the accept first
        self.outstanding_accepts.fetch_add(1, Ordering::AcqRel);
        let posted = post(ctx);
        if posted.is_err() {
            self.outstanding_accepts.fetch_sub(1, Ordering::AcqRel);
        }
        posted
    }

    pub(crate) fn handle_accept(&self, mut ctx: IoContext) {
        self.outstanding_accepts.fetch_sub(1, Ordering::AcqRel);
        let accepted = match &mut ctx.op {
            Operation::Accept { accepted } => accepted.take(),
            _ => None,
        };
        if let Some(accepted) = accepted {
            self.open_session(accepted);
        }
        self.rearm_accept(ctx);
    }

    pub(crate) fn handle_accept_error(&self, ctx: IoContext, err: &io::Error) {
        self.outstanding_accepts.fetch_sub(1, Ordering::AcqRel);
        if classify(err) == ErrorClass::PeerClosed {
            trace!(error = %err, "Connection aborted before accept");
            self.rearm_accept(ctx);
        } else {
            // Retrying at once would spin on errors such as EMFILE
            self.listener.remove_context(&ctx);
            warn!(
                error = %err,
                outstanding = self.outstanding_accepts(),
                "Accept failed, dropping accept slot"
            );
        }
    }

    fn open_session(&self, accepted: Accepted) {
        let Accepted {
            stream,
            local,
            peer,
        } = accepted;

        if let Some(size) = self.options.send_buffer_size {
            if let Err(e) = socket2::SockRef::from(&stream).set_send_buffer_size(size) {
                debug!(peer = %peer, error = %e, "Failed to set send buffer size");
            }
        }

        let handle = match self.port.associate_stream(stream) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to associate connection");
                return;
            }
        };
        let session = Arc::new(Session::new(
            SocketContextPool::new(handle, Arc::clone(&self.stats)),
            local,
            peer,
            Arc::clone(&self.callbacks),
            self.submitter.clone(),
            Arc::clone(&self.stats),
        ));
        let id = session.id();

        // Registered first, so the first receive always finds its session
        self.registry.insert(Arc::clone(&session));
        self.stats.connection_accepted();
        debug!(
            socket = %id,
            local = session.local_addr(),
            remote = session.remote_addr(),
            "Accepted connection"
        );

        session.handle_connected();

        let recv = session.pool().new_context(Operation::Recv {
            buf: vec![0u8; self.options.recv_buffer_size.max(1)],
        });
        if let Err(Rejected(ctx)) = self.submitter.post(recv) {
            session.release_context(ctx);
            self.registry.remove(id);
            session.close();
            warn!(socket = %id, "Failed to post first receive");
        }
    }

    /// Put an accept slot back in service. If the slot cannot be re-posted,
    /// one fresh replacement is tried before the pool shrinks.
    fn rearm_accept(&self, ctx: IoContext) {
        self.rearm_accept_with(ctx, |ctx| self.submitter.post(ctx));
    }

    fn rearm_accept_with(
        &self,
        mut ctx: IoContext,
        post: impl Fn(IoContext) -> Result<(), Rejected>,
    ) {
        if !self.accepting.load(Ordering::Acquire) {
            self.listener.remove_context(&ctx);
            return;
        }

        ctx.op = Operation::Accept { accepted: None };
        let Err(Rejected(ctx)) = self.post_accept_with(ctx, &post) else {
            return;
        };
        self.listener.remove_context(&ctx);

        let replacement = self
            .listener
            .new_context(Operation::Accept { accepted: None });
        if let Err(Rejected(ctx)) = self.post_accept_with(replacement, &post) {
            self.listener.remove_context(&ctx);
            warn!(
                outstanding = self.outstanding_accepts(),
                "Failed to re-arm accept, accept pool shrinks"
            );
        }
    }

    fn outstanding_accepts(&self) -> usize {
        self.outstanding_accepts.load(Ordering::Acquire)
    }
}

/// Resources owned while the server runs.
struct Running {
    engine: Arc<Engine>,
    workers: WorkerPool,
    local_addr: SocketAddr,
}

impl Running {
    fn shutdown(mut self) {
        self.engine.accepting.store(false, Ordering::Release);
        self.workers.stop(self.engine.port());

        // Sessions close silently at shutdown
        let sessions = self.engine.registry.drain();
        let count = sessions.len();
        drop(sessions);

        self.engine.port().shutdown();
        debug!(sessions = count, "Closed remaining sessions");
    }
}

/// A TCP server driven by a completion queue and a fixed worker pool.
///
/// ```no_run
/// use completion_server::Server;
///
/// let server = Server::new("127.0.0.1", 8888).on_message(|session, buf| {
///     session.send(buf.peek());
///     buf.retrieve_all();
/// });
/// server.start()?;
/// # Ok::<(), completion_server::StartError>(())
/// ```
pub struct Server {
    address: String,
    port: u16,
    options: ServerOptions,
    callbacks: Arc<Callbacks>,
    stats: Arc<ResourceStats>,
    state: AtomicU8,
    lifecycle: Mutex<Option<Running>>,
}

impl Server {
    /// Create a stopped server for `address` (a literal IP) and `port`.
    /// Port 0 binds an ephemeral port; see [`Server::local_addr`].
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            options: ServerOptions::default(),
            callbacks: Arc::new(Callbacks::default()),
            stats: Arc::new(ResourceStats::new()),
            state: AtomicU8::new(ServerState::Stopped as u8),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.callbacks).connected = Some(Arc::new(f));
        self
    }

    /// Called with the accumulated inbound bytes after every receive.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Session>, &mut Buffer) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.callbacks).message = Some(Arc::new(f));
        self
    }

    pub fn on_send_completed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.callbacks).send_completed = Some(Arc::new(f));
        self
    }

    /// Called once when a session is dropped after a disconnect or a
    /// transport error. Not called for sessions closed by [`Server::stop`].
    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.callbacks).disconnected = Some(Arc::new(f));
        self
    }

    /// Bind, start the workers and post the accept pool.
    ///
    /// Returns `Ok` without doing anything if the server is already running.
    /// On failure everything started so far is released and the server is
    /// left stopped, ready for another attempt.
    pub fn start(&self) -> Result<(), StartError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Ok(());
        }

        self.set_state(ServerState::Starting);
        match self.launch() {
            Ok(running) => {
                info!(
                    address = %running.local_addr,
                    workers = running.workers.len(),
                    accept_pool = running.engine.outstanding_accepts(),
                    "Server listening"
                );
                *lifecycle = Some(running);
                self.set_state(ServerState::Running);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start server");
                self.set_state(ServerState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop the workers and close the listener and every session.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let Some(running) = lifecycle.take() else {
            return;
        };

        self.set_state(ServerState::Stopping);
        running.shutdown();
        self.set_state(ServerState::Stopped);
        info!("Server stopped");
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn session_count(&self) -> usize {
        self.lifecycle
            .lock()
            .as_ref()
            .map_or(0, |r| r.engine.registry.len())
    }

    /// Accept operations currently posted on the listener.
    pub fn outstanding_accepts(&self) -> usize {
        self.lifecycle
            .lock()
            .as_ref()
            .map_or(0, |r| r.engine.outstanding_accepts())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn launch(&self) -> Result<Running, StartError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| StartError::InvalidAddress {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        let addr = SocketAddr::new(ip, self.port);

        let port = CompletionPort::new(Arc::clone(&self.stats)).map_err(StartError::CompletionQueue)?;

        let listener = create_listener(addr, self.options.backlog)
            .map_err(|source| StartError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartError::Listen { addr, source })?;
        let handle = port
            .associate_listener(TcpListener::from_std(listener))
            .map_err(|source| StartError::Listen { addr, source })?;

        let engine = Arc::new(Engine::new(
            port,
            handle,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.stats),
            self.options,
        ));

        let mut workers =
            WorkerPool::start(self.options.workers.max(1), &engine).map_err(StartError::Workers)?;

        if engine.prime_accepts() == 0 {
            workers.stop(engine.port());
            return Err(StartError::AcceptPool);
        }

        Ok(Running {
            engine,
            workers,
            local_addr,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
