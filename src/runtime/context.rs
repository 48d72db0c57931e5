//! I/O contexts and the per-socket pool that owns them.
//!
//! Every operation posted to the completion port travels as an [`IoContext`].
//! The context owns its buffer and moves into the driver while the operation
//! is in flight, coming back inside the completion. The pool only keeps
//! generation-checked bookkeeping slots, so a stale or duplicate release can
//! never free a slot that was handed out again.

use crate::runtime::port::SocketHandle;
use crate::runtime::stats::ResourceStats;
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Transfer unit of a receive context.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 8 * 1024;

/// Identifies a socket registered with the completion port.
///
/// Ids are never reused, unlike file descriptors, so a late completion can
/// not be confused with a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) usize);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Recv,
    Send,
}

/// A connection produced by a completed accept.
#[derive(Debug)]
pub struct Accepted {
    pub stream: mio::net::TcpStream,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Kind-specific payload of an operation.
#[derive(Debug)]
pub enum Operation {
    /// Accept on a listener. `accepted` is filled in by the driver.
    Accept { accepted: Option<Accepted> },
    /// Receive into `buf`, a fixed transfer unit.
    Recv { buf: Vec<u8> },
    /// Send the whole of `block`.
    Send { block: Bytes },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Accept { .. } => OpKind::Accept,
            Operation::Recv { .. } => OpKind::Recv,
            Operation::Send { .. } => OpKind::Send,
        }
    }
}

/// Stable, generation-checked handle to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextKey {
    index: usize,
    generation: u32,
}

/// One outstanding (or about to be posted) operation.
#[derive(Debug)]
pub struct IoContext {
    pub(crate) key: ContextKey,
    pub(crate) socket: SocketId,
    pub(crate) op: Operation,
}

impl IoContext {
    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
}

#[derive(Debug)]
struct Slots {
    entries: Slab<Slot>,
    next_generation: u32,
}

/// Owns every context of one socket, and the socket itself.
///
/// Dropping the pool frees the remaining slots first and then closes the
/// socket through its [`SocketHandle`]. Operations still parked in the driver
/// complete with an abort error; since their buffers travel with them, no
/// completion can reach freed memory.
pub struct SocketContextPool {
    slots: Mutex<Slots>,
    stats: Arc<ResourceStats>,
    handle: SocketHandle,
}

impl SocketContextPool {
    pub fn new(handle: SocketHandle, stats: Arc<ResourceStats>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Slab::new(),
                next_generation: 0,
            }),
            stats,
            handle,
        }
    }

    /// The socket this pool belongs to.
    pub fn socket(&self) -> SocketId {
        self.handle.id()
    }

    /// Close the socket now rather than when the pool drops. Parked
    /// operations complete with an abort error; later posts are refused by
    /// the driver with `NotConnected`.
    pub fn close_socket(&self) {
        self.handle.close();
    }

    /// Register a new context for `op`, bound to this pool's socket.
    pub fn new_context(&self, op: Operation) -> IoContext {
        let key = {
            let mut slots = self.slots.lock();
            let generation = slots.next_generation;
            slots.next_generation = generation.wrapping_add(1);
            let index = slots.entries.insert(Slot { generation });
            ContextKey { index, generation }
        };
        self.stats.context_allocated();

        IoContext {
            key,
            socket: self.socket(),
            op,
        }
    }

    /// Deregister `ctx`. Returns false if it is unknown or stale.
    pub fn remove_context(&self, ctx: &IoContext) -> bool {
        if ctx.socket != self.socket() {
            return false;
        }

        let removed = {
            let mut slots = self.slots.lock();
            match slots.entries.get(ctx.key.index) {
                Some(slot) if slot.generation == ctx.key.generation => {
                    slots.entries.remove(ctx.key.index);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.stats.contexts_freed(1);
        }
        removed
    }

    /// Check if `key` refers to a live slot. Completions whose slot was
    /// already released are stale and must be ignored.
    pub fn contains(&self, key: ContextKey) -> bool {
        self.slots
            .lock()
            .entries
            .get(key.index)
            .is_some_and(|slot| slot.generation == key.generation)
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SocketContextPool {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        let freed = slots.entries.len();
        slots.entries.clear();
        self.stats.contexts_freed(freed);
        // `handle` drops after this body and closes the socket
    }
}

impl fmt::Debug for SocketContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketContextPool")
            .field("socket", &self.socket())
            .field("contexts", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::port::{test_submitter, Submission};

    #[test]
    fn test_context_lifecycle() {
        let (submitter, _rx, _poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let pool = SocketContextPool::new(
            SocketHandle::new(SocketId(7), submitter),
            Arc::clone(&stats),
        );

        let recv = pool.new_context(Operation::Recv { buf: vec![0; 16] });
        let send = pool.new_context(Operation::Send {
            block: Bytes::from_static(b"hi"),
        });

        assert_eq!(recv.socket(), SocketId(7));
        assert_eq!(recv.kind(), OpKind::Recv);
        assert_eq!(pool.len(), 2);
        assert_eq!(send.kind(), OpKind::Send);
        assert_eq!(stats.snapshot().live_contexts, 2);

        assert!(pool.remove_context(&send));
        // Second removal is a no-op
        assert!(!pool.remove_context(&send));
        assert!(!pool.contains(send.key()));
        assert!(pool.contains(recv.key()));
        assert_eq!(stats.snapshot().live_contexts, 1);
    }

    #[test]
    fn test_stale_key_does_not_free_reused_slot() {
        let (submitter, _rx, _poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let pool = SocketContextPool::new(SocketHandle::new(SocketId(1), submitter), stats);

        let first = pool.new_context(Operation::Recv { buf: Vec::new() });
        assert!(pool.remove_context(&first));

        // Slab hands the same index out again, with a new generation
        let second = pool.new_context(Operation::Recv { buf: Vec::new() });
        assert_ne!(first.key(), second.key());

        assert!(!pool.remove_context(&first));
        assert!(pool.contains(second.key()));
    }

    #[test]
    fn test_foreign_context_is_ignored() {
        let (submitter, _rx, _poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let a = SocketContextPool::new(
            SocketHandle::new(SocketId(1), submitter.clone()),
            Arc::clone(&stats),
        );
        let b = SocketContextPool::new(SocketHandle::new(SocketId(2), submitter), stats);

        let ctx = a.new_context(Operation::Recv { buf: Vec::new() });
        assert!(!b.remove_context(&ctx));
        assert!(a.contains(ctx.key()));
    }

    #[test]
    fn test_drop_frees_contexts_then_closes_socket() {
        let (submitter, rx, _poll) = test_submitter();
        let stats = Arc::new(ResourceStats::new());
        let pool = SocketContextPool::new(
            SocketHandle::new(SocketId(3), submitter),
            Arc::clone(&stats),
        );

        let _in_flight = pool.new_context(Operation::Recv { buf: vec![0; 8] });
        let _other = pool.new_context(Operation::Send {
            block: Bytes::from_static(b"x"),
        });
        drop(pool);

        assert_eq!(stats.snapshot().live_contexts, 0);
        assert!(matches!(rx.try_recv(), Ok(Submission::Close(SocketId(3)))));
    }
}
