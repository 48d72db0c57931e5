//! Driver thread: turns readiness into completions.
//!
//! Readiness is edge-triggered, so every operation is attempted as soon as it
//! is posted and only parked after the kernel reports `WouldBlock`. A parked
//! operation is retried on the next readiness edge for its socket. Each
//! attempt performs exactly one syscall, so a short write is reported as a
//! partial completion rather than retried here.

use super::{Completion, Source, Submission, WAKE_TOKEN};
use crate::runtime::context::{Accepted, IoContext, OpKind, Operation, SocketId};
use crate::runtime::stats::ResourceStats;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, error, trace};

const EVENTS_CAPACITY: usize = 1024;

/// A socket owned by the driver, with its parked operations.
enum Registered {
    Listener {
        listener: TcpListener,
        /// Served in posting order.
        accepts: VecDeque<IoContext>,
    },
    Stream {
        stream: TcpStream,
        recv: Option<IoContext>,
        send: Option<IoContext>,
    },
}

/// Outcome of one attempt at an operation.
enum Attempt {
    Done(IoContext, io::Result<usize>),
    Pending(IoContext),
}

pub(super) struct Driver {
    poll: Poll,
    submissions: Receiver<Submission>,
    completions: Sender<Completion>,
    sockets: HashMap<SocketId, Registered>,
    stats: Arc<ResourceStats>,
}

impl Driver {
    pub(super) fn new(
        poll: Poll,
        submissions: Receiver<Submission>,
        completions: Sender<Completion>,
        stats: Arc<ResourceStats>,
    ) -> Self {
        Self {
            poll,
            submissions,
            completions,
            sockets: HashMap::new(),
            stats,
        }
    }

    pub(super) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!("Completion driver started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Completion driver poll failed");
                break;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                self.on_ready(SocketId(event.token().0), readable, writable);
            }

            if !self.drain_submissions() {
                break;
            }
        }

        self.close_all();
        debug!("Completion driver stopped");
    }

    /// Process every queued submission. Returns false once the driver
    /// should exit.
    fn drain_submissions(&mut self) -> bool {
        loop {
            match self.submissions.try_recv() {
                Ok(Submission::Attach { id, source }) => self.attach(id, source),
                Ok(Submission::Post(ctx)) => self.post(ctx),
                Ok(Submission::Close(id)) => self.close(id),
                Ok(Submission::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn attach(&mut self, id: SocketId, source: Source) {
        let registered = match source {
            Source::Listener(listener) => Registered::Listener {
                listener,
                accepts: VecDeque::new(),
            },
            Source::Stream(stream) => Registered::Stream {
                stream,
                recv: None,
                send: None,
            },
        };
        self.sockets.insert(id, registered);
        self.stats.socket_opened();
        trace!(socket = %id, "Socket attached");
    }

    fn post(&mut self, ctx: IoContext) {
        let completions = &self.completions;
        let Some(registered) = self.sockets.get_mut(&ctx.socket) else {
            complete(
                completions,
                ctx,
                Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
            );
            return;
        };

        match registered {
            Registered::Listener { listener, accepts } => {
                if ctx.kind() != OpKind::Accept {
                    complete(completions, ctx, Err(unsupported(OpKind::Accept)));
                } else if !accepts.is_empty() {
                    // Earlier accepts already hit WouldBlock; wait for readiness
                    accepts.push_back(ctx);
                } else {
                    match attempt_accept(listener, ctx) {
                        Attempt::Done(ctx, result) => complete(completions, ctx, result),
                        Attempt::Pending(ctx) => accepts.push_back(ctx),
                    }
                }
            }
            Registered::Stream { stream, recv, send } => {
                let slot = match ctx.kind() {
                    OpKind::Recv => recv,
                    OpKind::Send => send,
                    OpKind::Accept => {
                        complete(completions, ctx, Err(unsupported(OpKind::Recv)));
                        return;
                    }
                };
                if slot.is_some() {
                    complete(
                        completions,
                        ctx,
                        Err(io::Error::new(
                            io::ErrorKind::Other,
                            "operation of this kind already pending",
                        )),
                    );
                    return;
                }
                match attempt_stream(stream, ctx) {
                    Attempt::Done(ctx, result) => complete(completions, ctx, result),
                    Attempt::Pending(ctx) => *slot = Some(ctx),
                }
            }
        }
    }

    fn on_ready(&mut self, id: SocketId, readable: bool, writable: bool) {
        let completions = &self.completions;
        let Some(registered) = self.sockets.get_mut(&id) else {
            return;
        };

        match registered {
            Registered::Listener { listener, accepts } => {
                if !readable {
                    return;
                }
                while let Some(ctx) = accepts.pop_front() {
                    match attempt_accept(listener, ctx) {
                        Attempt::Done(ctx, result) => complete(completions, ctx, result),
                        Attempt::Pending(ctx) => {
                            accepts.push_front(ctx);
                            break;
                        }
                    }
                }
            }
            Registered::Stream { stream, recv, send } => {
                if readable {
                    retry(stream, recv, completions);
                }
                if writable {
                    retry(stream, send, completions);
                }
            }
        }
    }

    fn close(&mut self, id: SocketId) {
        let Some(registered) = self.sockets.remove(&id) else {
            return;
        };
        let parked = self.release(registered);
        self.stats.sockets_closed(1);

        for ctx in parked {
            complete(
                &self.completions,
                ctx,
                Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "socket closed with operation pending",
                )),
            );
        }
        trace!(socket = %id, "Socket closed");
    }

    fn close_all(&mut self) {
        let sockets: Vec<Registered> = self.sockets.drain().map(|(_, r)| r).collect();
        let count = sockets.len();
        for registered in sockets {
            // Workers are gone by now; parked operations are simply dropped
            drop(self.release(registered));
        }
        self.stats.sockets_closed(count);
    }

    /// Deregister a socket and return its parked operations. The socket
    /// itself is closed when `registered` drops at the end of this call.
    fn release(&self, registered: Registered) -> Vec<IoContext> {
        let registry = self.poll.registry();
        match registered {
            Registered::Listener {
                mut listener,
                accepts,
            } => {
                let _ = registry.deregister(&mut listener);
                accepts.into_iter().collect()
            }
            Registered::Stream {
                mut stream,
                recv,
                send,
            } => {
                let _ = registry.deregister(&mut stream);
                recv.into_iter().chain(send).collect()
            }
        }
    }
}

fn complete(completions: &Sender<Completion>, ctx: IoContext, result: io::Result<usize>) {
    // Receivers live as long as the port, which outlives the driver
    let _ = completions.send(Completion::Io { ctx, result });
}

fn unsupported(expected: OpKind) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("operation not supported on this socket, expected {expected:?}"),
    )
}

/// Retry a parked stream operation after a readiness edge.
fn retry(stream: &mut TcpStream, slot: &mut Option<IoContext>, completions: &Sender<Completion>) {
    if let Some(ctx) = slot.take() {
        match attempt_stream(stream, ctx) {
            Attempt::Done(ctx, result) => complete(completions, ctx, result),
            Attempt::Pending(ctx) => *slot = Some(ctx),
        }
    }
}

fn attempt_stream(stream: &mut TcpStream, mut ctx: IoContext) -> Attempt {
    let outcome = match &mut ctx.op {
        Operation::Recv { buf } => once(|| stream.read(buf)),
        Operation::Send { block } => once(|| stream.write(block)),
        Operation::Accept { .. } => Some(Err(unsupported(OpKind::Recv))),
    };
    match outcome {
        Some(result) => Attempt::Done(ctx, result),
        None => Attempt::Pending(ctx),
    }
}

fn attempt_accept(listener: &TcpListener, mut ctx: IoContext) -> Attempt {
    let outcome = once(|| {
        let (stream, peer) = listener.accept()?;
        let local = stream.local_addr()?;
        Ok(Accepted {
            stream,
            local,
            peer,
        })
    });

    match outcome {
        None => Attempt::Pending(ctx),
        Some(Ok(accepted)) => {
            if let Operation::Accept { accepted: slot } = &mut ctx.op {
                *slot = Some(accepted);
            }
            Attempt::Done(ctx, Ok(0))
        }
        Some(Err(e)) => Attempt::Done(ctx, Err(e)),
    }
}

/// Run a non-blocking syscall once, restarting on `EINTR`.
///
/// Returns `None` if the socket is not ready.
fn once<T>(mut f: impl FnMut() -> io::Result<T>) -> Option<io::Result<T>> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            result => return Some(result),
        }
    }
}
