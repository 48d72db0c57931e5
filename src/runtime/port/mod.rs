//! Completion port: the queue every worker thread blocks on.
//!
//! Unix kernels expose readiness (epoll/kqueue) rather than completions, so
//! the port runs a small proactor. A driver thread owns the `mio::Poll`;
//! operations posted through a [`Submitter`] are attempted immediately and,
//! if the socket is not ready, parked until it is. Each finished operation is
//! pushed onto a shared MPMC queue as a [`Completion`], carrying its
//! [`IoContext`] (and buffer) back to whichever worker dequeues it.
//!
//! ```text
//!  Session / Engine ──post──► [submissions] ──► driver thread (mio::Poll)
//!                                                    │ read/write/accept
//!  worker-0..N ◄────────── [completions] ◄──────────┘
//! ```

mod driver;

use crate::runtime::context::{IoContext, SocketId};
use crate::runtime::stats::ResourceStats;
use crossbeam_channel::{unbounded, Receiver, Sender};
use driver::Driver;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, warn};

/// Token reserved for the driver's waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// An event dequeued by a worker.
#[derive(Debug)]
pub enum Completion {
    /// A posted operation finished. `result` is the byte count of the
    /// transfer (always 0 for accepts) or the error that ended it.
    Io {
        ctx: IoContext,
        result: io::Result<usize>,
    },
    /// Null post used to unblock a waiting worker.
    Wake,
}

/// Requests handled by the driver thread, in FIFO order.
#[derive(Debug)]
pub(crate) enum Submission {
    /// Hand a registered socket over to the driver.
    Attach { id: SocketId, source: Source },
    /// Start an operation.
    Post(IoContext),
    /// Deregister and close a socket, aborting its parked operations.
    Close(SocketId),
    /// Stop the driver, closing every socket it still owns.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Source {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// A post the driver can no longer accept; the context is handed back.
#[derive(Debug)]
pub struct Rejected(pub IoContext);

/// Cloneable handle for posting operations from any thread.
#[derive(Clone)]
pub struct Submitter {
    tx: Sender<Submission>,
    waker: Arc<Waker>,
}

impl Submitter {
    pub(crate) fn new(tx: Sender<Submission>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Post an operation. Fire-and-forget: its outcome arrives as a
    /// [`Completion`] on some worker.
    pub fn post(&self, ctx: IoContext) -> Result<(), Rejected> {
        match self.submit(Submission::Post(ctx)) {
            Err(Submission::Post(ctx)) => Err(Rejected(ctx)),
            _ => Ok(()),
        }
    }

    pub(crate) fn close(&self, id: SocketId) {
        // A stopped driver has already closed everything
        let _ = self.submit(Submission::Close(id));
    }

    fn submit(&self, submission: Submission) -> Result<(), Submission> {
        self.tx.send(submission).map_err(|e| e.into_inner())?;
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake completion driver");
        }
        Ok(())
    }
}

/// Ownership of one socket registered with the port.
///
/// Dropping the handle closes the socket.
pub struct SocketHandle {
    id: SocketId,
    submitter: Submitter,
}

impl SocketHandle {
    pub(crate) fn new(id: SocketId, submitter: Submitter) -> Self {
        Self { id, submitter }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Close the socket ahead of the drop. Closing twice is harmless since
    /// ids are never reused.
    pub fn close(&self) {
        self.submitter.close(self.id);
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// The completion queue plus the driver thread feeding it.
pub struct CompletionPort {
    submitter: Submitter,
    registry: Registry,
    completions: Receiver<Completion>,
    completion_tx: Sender<Completion>,
    next_socket: AtomicUsize,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionPort {
    /// Create the poller and start the driver thread.
    pub fn new(stats: Arc<ResourceStats>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let (tx, submissions) = unbounded();
        let (completion_tx, completions) = unbounded();

        let driver = Driver::new(poll, submissions, completion_tx.clone(), stats);
        let handle = thread::Builder::new()
            .name("completion-driver".to_string())
            .spawn(move || driver.run())?;

        Ok(Self {
            submitter: Submitter::new(tx, waker),
            registry,
            completions,
            completion_tx,
            next_socket: AtomicUsize::new(0),
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    /// Associate an accepted connection with the port.
    pub fn associate_stream(&self, mut stream: TcpStream) -> io::Result<SocketHandle> {
        let id = self.next_id();
        self.registry.register(
            &mut stream,
            Token(id.0),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.attach(id, Source::Stream(stream))
    }

    /// Associate a listening socket with the port.
    pub fn associate_listener(&self, mut listener: TcpListener) -> io::Result<SocketHandle> {
        let id = self.next_id();
        self.registry
            .register(&mut listener, Token(id.0), Interest::READABLE)?;
        self.attach(id, Source::Listener(listener))
    }

    /// Block until the next completion.
    pub fn wait(&self) -> Option<Completion> {
        self.completions.recv().ok()
    }

    /// Unblock one waiting worker.
    pub fn post_wake(&self) {
        // The port holds a receiver, so this cannot fail
        let _ = self.completion_tx.send(Completion::Wake);
    }

    /// Stop the driver thread and close every socket it still owns.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.driver.lock().take() else {
            return;
        };
        let _ = self.submitter.submit(Submission::Shutdown);
        if handle.join().is_err() {
            error!("Completion driver panicked");
        }
    }

    fn next_id(&self) -> SocketId {
        SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed))
    }

    fn attach(&self, id: SocketId, source: Source) -> io::Result<SocketHandle> {
        self.submitter
            .submit(Submission::Attach { id, source })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "completion driver stopped"))?;
        Ok(SocketHandle::new(id, self.submitter()))
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) fn test_submitter() -> (Submitter, Receiver<Submission>, Poll) {
    let poll = Poll::new().unwrap();
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).unwrap());
    let (tx, rx) = unbounded();
    (Submitter::new(tx, waker), rx, poll)
}
