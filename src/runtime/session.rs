//! Per-connection state: inbound accumulation, the outbound queue and the
//! application callbacks.
//!
//! At most one send is outstanding per session. Whoever flips `is_sending`
//! from false to true (a fresh [`Session::send`] or a send completion) owns
//! the right to post the next block; everybody else only enqueues. The flag is
//! cleared on full completions only, so a partial send keeps the claim while
//! its suffix goes back to the head of the queue.
//!
//! Once the engine drops a session it is closed: its socket is shut at once,
//! even if the application still holds the session, and further sends are
//! discarded.

use crate::runtime::buffer::Buffer;
use crate::runtime::context::{IoContext, OpKind, Operation, SocketContextPool, SocketId};
use crate::runtime::port::{Rejected, Submitter};
use crate::runtime::stats::ResourceStats;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Callback taking only the session: connected, send-completed, disconnected.
pub type SessionCallback = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Callback for inbound data. Must `retrieve` whatever it consumed; the rest
/// stays in the buffer for the next receive.
pub type MessageCallback = Arc<dyn Fn(&Arc<Session>, &mut Buffer) + Send + Sync>;

/// The application hooks shared by every session of one server.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) connected: Option<SessionCallback>,
    pub(crate) message: Option<MessageCallback>,
    pub(crate) send_completed: Option<SessionCallback>,
    pub(crate) disconnected: Option<SessionCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("connected", &self.connected.is_some())
            .field("message", &self.message.is_some())
            .field("send_completed", &self.send_completed.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .finish()
    }
}

/// One accepted connection.
pub struct Session {
    pool: SocketContextPool,
    local_addr: String,
    remote_addr: String,
    inbound: Mutex<Buffer>,
    send_queue: Mutex<VecDeque<Bytes>>,
    is_sending: AtomicBool,
    closed: AtomicBool,
    callbacks: Arc<Callbacks>,
    submitter: Submitter,
    stats: Arc<ResourceStats>,
}

impl Session {
    pub(crate) fn new(
        pool: SocketContextPool,
        local: SocketAddr,
        remote: SocketAddr,
        callbacks: Arc<Callbacks>,
        submitter: Submitter,
        stats: Arc<ResourceStats>,
    ) -> Self {
        Self {
            pool,
            local_addr: local.to_string(),
            remote_addr: remote.to_string(),
            inbound: Mutex::new(Buffer::new()),
            send_queue: Mutex::new(VecDeque::new()),
            is_sending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callbacks,
            submitter,
            stats,
        }
    }

    pub fn id(&self) -> SocketId {
        self.pool.socket()
    }

    /// Local endpoint as `ip:port`.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Peer endpoint as `ip:port`.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Queue `data` for transmission.
    ///
    /// Safe to call from any thread. Blocks reach the peer in the order they
    /// were queued; nothing is reported if the connection fails first. Once
    /// the session is closed, `send` discards its input.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.is_closed() {
            self.send_queue.lock().clear();
            return;
        }
        self.send_queue
            .lock()
            .push_back(Bytes::copy_from_slice(data));
        self.try_send_next(None);
    }

    /// Check if the engine has dropped this session.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Blocks waiting behind the one in flight.
    pub fn pending_sends(&self) -> usize {
        self.send_queue.lock().len()
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending.load(Ordering::Acquire)
    }

    pub(crate) fn pool(&self) -> &SocketContextPool {
        &self.pool
    }

    pub(crate) fn handle_connected(self: &Arc<Self>) {
        if let Some(cb) = &self.callbacks.connected {
            cb(self);
        }
    }

    /// Mark the session closed, discard queued sends and close the socket.
    /// Operations still parked on it complete with an abort error.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_queue.lock().clear();
        self.pool.close_socket();
    }

    /// Give back a context whose operation will not be continued, releasing
    /// the send claim if it carried the in-flight send.
    pub(crate) fn release_context(&self, ctx: IoContext) {
        if self.pool.remove_context(&ctx) && ctx.kind() == OpKind::Send {
            self.is_sending.store(false, Ordering::Release);
        }
    }

    pub(crate) fn handle_disconnected(self: &Arc<Self>) {
        if let Some(cb) = &self.callbacks.disconnected {
            cb(self);
        }
    }

    /// Append received bytes and hand the accumulated buffer to the
    /// application.
    pub(crate) fn handle_recv(self: &Arc<Self>, data: &[u8]) {
        let mut inbound = self.inbound.lock();
        inbound.write(data);
        if let Some(cb) = &self.callbacks.message {
            cb(self, &mut *inbound);
        }
    }

    /// A send wrote only `written` bytes of its block. Requeues the rest at
    /// the head and reissues it on the same context, keeping the claim.
    pub(crate) fn handle_send_uncompleted(&self, ctx: IoContext, written: usize) {
        let Operation::Send { block } = &ctx.op else {
            self.pool.remove_context(&ctx);
            return;
        };
        let rest = block.slice(written.min(block.len())..);
        self.stats.partial_send();
        trace!(socket = %self.id(), written, remaining = rest.len(), "Partial send");

        self.send_queue.lock().push_front(rest);
        if let Err(spare) = self.post_head(Some(ctx)) {
            self.is_sending.store(false, Ordering::Release);
            self.try_send_next(spare);
        }
    }

    pub(crate) fn handle_send_completed(self: &Arc<Self>, ctx: IoContext) {
        self.is_sending.store(false, Ordering::Release);
        self.try_send_next(Some(ctx));
        if let Some(cb) = &self.callbacks.send_completed {
            cb(self);
        }
    }

    /// Claim the send flag and post the head of the queue, reusing `spare`
    /// if given. A spare context that ends up unused is freed.
    fn try_send_next(&self, mut spare: Option<IoContext>) {
        while self
            .is_sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            match self.post_head(spare.take()) {
                Ok(()) => return,
                Err(ctx) => {
                    spare = ctx;
                    self.is_sending.store(false, Ordering::Release);
                    // A block queued between the pop and the release saw the
                    // flag still set and left it to us
                    if self.send_queue.lock().is_empty() {
                        break;
                    }
                }
            }
        }
        if let Some(ctx) = spare {
            self.pool.remove_context(&ctx);
        }
    }

    /// Post the block at the head of the queue. The caller holds the claim.
    /// Hands `ctx` back if the queue is empty.
    fn post_head(&self, ctx: Option<IoContext>) -> Result<(), Option<IoContext>> {
        let Some(block) = self.send_queue.lock().pop_front() else {
            return Err(ctx);
        };
        let ctx = match ctx {
            Some(mut ctx) => {
                ctx.op = Operation::Send { block };
                ctx
            }
            None => self.pool.new_context(Operation::Send { block }),
        };

        if let Err(Rejected(ctx)) = self.submitter.post(ctx) {
            // No retry: the block is lost along with the connection
            self.is_sending.store(false, Ordering::Release);
            self.pool.remove_context(&ctx);
            warn!(socket = %self.id(), "Failed to post send");
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("is_sending", &self.is_sending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::port::{test_submitter, SocketHandle, Submission};
    use crossbeam_channel::Receiver;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn session(callbacks: Callbacks) -> (Arc<Session>, Receiver<Submission>, mio::Poll) {
        let (submitter, rx, poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let pool = SocketContextPool::new(
            SocketHandle::new(SocketId(1), submitter.clone()),
            Arc::clone(&stats),
        );
        let session = Session::new(
            pool,
            "127.0.0.1:8888".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            Arc::new(callbacks),
            submitter,
            stats,
        );
        (Arc::new(session), rx, poll)
    }

    /// Next posted send, with its payload.
    fn next_send(rx: &Receiver<Submission>) -> (IoContext, Bytes) {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Submission::Post(ctx)) => match &ctx.op {
                Operation::Send { block } => {
                    let block = block.clone();
                    (ctx, block)
                }
                other => panic!("unexpected op {other:?}"),
            },
            other => panic!("expected a post, got {other:?}"),
        }
    }

    #[test]
    fn test_addresses() {
        let (session, _rx, _poll) = session(Callbacks::default());
        assert_eq!(session.local_addr(), "127.0.0.1:8888");
        assert_eq!(session.remote_addr(), "127.0.0.1:50000");
        assert_eq!(session.id(), SocketId(1));
    }

    #[test]
    fn test_empty_send_is_noop() {
        let (session, rx, _poll) = session(Callbacks::default());
        session.send(b"");
        assert!(rx.try_recv().is_err());
        assert!(!session.is_sending());
    }

    #[test]
    fn test_sends_are_serialized_in_order() {
        let (session, rx, _poll) = session(Callbacks::default());
        session.send(b"one");
        session.send(b"two");
        session.send(b"three");

        // Only the first block is in flight
        let (ctx, block) = next_send(&rx);
        assert_eq!(&block[..], b"one");
        assert!(rx.try_recv().is_err());
        assert_eq!(session.pending_sends(), 2);

        session.handle_send_completed(ctx);
        let (ctx, block) = next_send(&rx);
        assert_eq!(&block[..], b"two");

        session.handle_send_completed(ctx);
        let (ctx, block) = next_send(&rx);
        assert_eq!(&block[..], b"three");

        session.handle_send_completed(ctx);
        assert!(rx.try_recv().is_err());
        assert!(!session.is_sending());
        assert!(session.pool().is_empty());
    }

    #[test]
    fn test_partial_send_requeues_suffix_first() {
        let (session, rx, _poll) = session(Callbacks::default());
        session.send(b"hello world");
        session.send(b"!");

        let (ctx, _) = next_send(&rx);
        let key = ctx.key();
        session.handle_send_uncompleted(ctx, 6);
        assert!(session.is_sending());

        // Same context carries the remainder ahead of the queued block
        let (ctx, block) = next_send(&rx);
        assert_eq!(ctx.key(), key);
        assert_eq!(&block[..], b"world");

        session.handle_send_completed(ctx);
        let (ctx, block) = next_send(&rx);
        assert_eq!(ctx.key(), key);
        assert_eq!(&block[..], b"!");

        session.handle_send_completed(ctx);
        assert_eq!(session.stats.snapshot().partial_sends, 1);
        assert_eq!(session.stats.snapshot().live_contexts, 0);
    }

    #[test]
    fn test_recv_accumulates_until_retrieved() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let callbacks = Callbacks {
            message: Some(Arc::new(move |_session: &Arc<Session>, buf: &mut Buffer| {
                log.lock().push(buf.peek().to_vec());
                // Consume only complete lines
                if let Some(pos) = buf.peek().iter().position(|&b| b == b'\n') {
                    buf.retrieve(pos + 1).unwrap();
                }
            })),
            ..Callbacks::default()
        };
        let (session, _rx, _poll) = session(callbacks);

        session.handle_recv(b"par");
        session.handle_recv(b"tial\nnext");

        let seen = seen.lock();
        assert_eq!(seen[0], b"par");
        assert_eq!(seen[1], b"partial\nnext");
        assert_eq!(session.inbound.lock().peek(), b"next");
    }

    #[test]
    fn test_send_completed_callback_fires_after_next_post() {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        let callbacks = Callbacks {
            send_completed: Some(Arc::new(move |session: &Arc<Session>| {
                count.fetch_add(1, Ordering::SeqCst);
                assert!(session.is_sending() || session.pending_sends() == 0);
            })),
            ..Callbacks::default()
        };
        let (session, rx, _poll) = session(callbacks);
        session.send(b"a");
        session.send(b"b");

        let (ctx, _) = next_send(&rx);
        session.handle_send_completed(ctx);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(session.is_sending());
    }

    #[test]
    fn test_rejected_post_releases_claim_and_context() {
        let (session, rx, _poll) = session(Callbacks::default());
        drop(rx);

        session.send(b"lost");
        assert!(!session.is_sending());
        assert!(session.pool().is_empty());
        assert_eq!(session.stats.snapshot().live_contexts, 0);
    }

    #[test]
    fn test_send_after_close_is_discarded() {
        let (session, rx, _poll) = session(Callbacks::default());
        session.close();
        session.close();
        assert!(matches!(rx.try_recv(), Ok(Submission::Close(SocketId(1)))));
        assert!(rx.try_recv().is_err());

        session.send(b"a");
        for _ in 0..1000 {
            session.send(b"b");
        }
        assert!(session.is_closed());
        assert!(!session.is_sending());
        assert_eq!(session.pending_sends(), 0);
        assert!(rx.try_recv().is_err());
        assert!(session.pool().is_empty());
    }

    #[test]
    fn test_release_of_failed_send_clears_claim() {
        let (session, rx, _poll) = session(Callbacks::default());
        session.send(b"doomed");
        session.send(b"queued");

        let (ctx, _) = next_send(&rx);
        assert!(session.is_sending());
        session.close();
        session.release_context(ctx);

        assert!(!session.is_sending());
        assert_eq!(session.pending_sends(), 0);
        assert!(session.pool().is_empty());
        assert_eq!(session.stats.snapshot().live_contexts, 0);
    }

    #[test]
    fn test_release_of_recv_keeps_send_claim() {
        let (session, rx, _poll) = session(Callbacks::default());
        let recv = session.pool().new_context(Operation::Recv { buf: vec![0; 8] });
        session.send(b"x");
        let (send, _) = next_send(&rx);

        session.release_context(recv);
        assert!(session.is_sending());
        assert_eq!(session.pool().len(), 1);

        session.release_context(send);
        assert!(!session.is_sending());
        assert!(session.pool().is_empty());
    }

    #[test]
    fn test_single_flight_under_concurrent_senders() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        let (session, rx, _poll) = session(Callbacks::default());

        let senders: Vec<_> = (0..THREADS)
            .map(|t| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        session.send(format!("{t}:{i};").as_bytes());
                    }
                })
            })
            .collect();

        // Fake driver: completes each send, checking nothing else was posted
        // while it was outstanding
        let mut received = Vec::new();
        while received.len() < THREADS * PER_THREAD {
            let (ctx, block) = next_send(&rx);
            assert!(session.is_sending());
            assert!(rx.try_recv().is_err(), "second send posted while one in flight");
            received.push(String::from_utf8(block.to_vec()).unwrap());
            session.handle_send_completed(ctx);
        }

        for sender in senders {
            sender.join().unwrap();
        }

        // Per-thread order survives
        for t in 0..THREADS {
            let prefix = format!("{t}:");
            let order: Vec<usize> = received
                .iter()
                .filter_map(|s| s.strip_prefix(&prefix))
                .map(|s| s.trim_end_matches(';').parse().unwrap())
                .collect();
            assert_eq!(order, (0..PER_THREAD).collect::<Vec<_>>());
        }
        assert!(!session.is_sending());
        assert_eq!(session.pending_sends(), 0);
    }
}
