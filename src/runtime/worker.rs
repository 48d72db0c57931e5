//! Worker threads draining the shared completion queue.
//!
//! Workers have no affinity to connections: consecutive completions of one
//! session may be handled on different threads. A session stays effectively
//! single-threaded on its receive path because the next receive is only
//! posted after the current one has been handled.

use crate::runtime::context::{IoContext, OpKind, Operation};
use crate::runtime::port::{Completion, CompletionPort};
use crate::server::Engine;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

/// How a failed completion is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Post the same context again.
    Transient,
    /// The peer went away; drop the session without noise.
    PeerClosed,
    /// Anything else; log and drop the session.
    Other,
}

pub(crate) fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            ErrorClass::Transient
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => ErrorClass::PeerClosed,
        _ => ErrorClass::Other,
    }
}

/// Fixed set of threads blocked on the completion queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `count` workers. If any spawn fails, the ones already running
    /// are stopped before the error is returned.
    pub(crate) fn start(count: usize, engine: &Arc<Engine>) -> io::Result<Self> {
        let mut pool = Self {
            handles: Vec::with_capacity(count),
            running: Arc::new(AtomicBool::new(true)),
        };

        for worker_id in 0..count {
            let worker_engine = Arc::clone(engine);
            let running = Arc::clone(&pool.running);
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &worker_engine, &running));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    pool.stop(engine.port());
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Signal every worker to exit and join them.
    ///
    /// Exactly one wake is posted per worker; each exits on the first wake it
    /// sees once the running flag is cleared.
    pub(crate) fn stop(&mut self, port: &CompletionPort) {
        self.running.store(false, Ordering::Release);
        for _ in &self.handles {
            port.post_wake();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn worker_loop(worker_id: usize, engine: &Arc<Engine>, running: &AtomicBool) {
    debug!(worker = worker_id, "Worker started");

    while let Some(completion) = engine.port().wait() {
        match completion {
            Completion::Wake => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Completion::Io { ctx, result } => dispatch(engine, ctx, result),
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

fn dispatch(engine: &Arc<Engine>, ctx: IoContext, result: io::Result<usize>) {
    let socket = ctx.socket();
    let kind = ctx.kind();

    if kind == OpKind::Accept {
        match result {
            Ok(_) => engine.handle_accept(ctx),
            Err(e) if classify(&e) == ErrorClass::Transient => engine.repost(ctx),
            Err(e) => engine.handle_accept_error(ctx, &e),
        }
        return;
    }

    let Some(session) = engine.session(socket) else {
        engine.release_orphan(ctx);
        return;
    };
    if !session.pool().contains(ctx.key()) {
        trace!(socket = %socket, op = ?kind, "Stale completion ignored");
        return;
    }

    let transferred = match result {
        Ok(0) => {
            trace!(socket = %socket, op = ?kind, "Zero-byte transfer, peer closed");
            session.release_context(ctx);
            engine.drop_session(socket);
            return;
        }
        Ok(n) => n,
        Err(e) => {
            match classify(&e) {
                ErrorClass::Transient => {
                    engine.repost(ctx);
                    return;
                }
                ErrorClass::PeerClosed => {
                    trace!(socket = %socket, op = ?kind, error = %e, "Peer closed");
                }
                ErrorClass::Other => {
                    warn!(socket = %socket, op = ?kind, error = %e, "Transport error, dropping session");
                }
            }
            session.release_context(ctx);
            engine.drop_session(socket);
            return;
        }
    };

    match &ctx.op {
        Operation::Recv { buf } => {
            session.handle_recv(&buf[..transferred]);
            engine.repost(ctx);
        }
        Operation::Send { block } => {
            if transferred < block.len() {
                session.handle_send_uncompleted(ctx, transferred);
            } else {
                session.handle_send_completed(ctx);
            }
        }
        Operation::Accept { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let class = |kind: io::ErrorKind| classify(&io::Error::from(kind));

        assert_eq!(class(io::ErrorKind::TimedOut), ErrorClass::Transient);
        assert_eq!(class(io::ErrorKind::WouldBlock), ErrorClass::Transient);
        assert_eq!(class(io::ErrorKind::Interrupted), ErrorClass::Transient);

        assert_eq!(class(io::ErrorKind::ConnectionReset), ErrorClass::PeerClosed);
        assert_eq!(class(io::ErrorKind::ConnectionAborted), ErrorClass::PeerClosed);
        assert_eq!(class(io::ErrorKind::BrokenPipe), ErrorClass::PeerClosed);
        assert_eq!(class(io::ErrorKind::UnexpectedEof), ErrorClass::PeerClosed);
        assert_eq!(class(io::ErrorKind::NotConnected), ErrorClass::PeerClosed);

        assert_eq!(class(io::ErrorKind::PermissionDenied), ErrorClass::Other);
        assert_eq!(class(io::ErrorKind::InvalidInput), ErrorClass::Other);
    }
}
