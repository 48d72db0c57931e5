//! completion-server: a multi-threaded TCP server engine built around a
//! completion queue.
//!
//! Operations (accept, receive, send) are posted and finish asynchronously;
//! a fixed pool of worker threads drains the shared queue of completions and
//! drives per-connection [`Session`]s. Applications plug in through four
//! callbacks: connected, message, send-completed and disconnected.
//!
//! - Sends are queued per session and issued one at a time, so bytes reach
//!   the peer in `send` order even when `send` is called from many threads.
//! - Inbound bytes accumulate in a [`Buffer`] until the message callback
//!   retrieves them; no framing is imposed.
//! - Partial sends and peer disconnects are handled internally. Only
//!   [`Server::start`] reports errors to the caller.

pub mod error;
pub mod runtime;
pub mod server;

pub use error::{BufferError, StartError};
pub use runtime::{Buffer, Session, SocketId, StatsSnapshot, DEFAULT_RECV_BUFFER_SIZE};
pub use server::{
    Server, ServerOptions, ServerState, DEFAULT_BACKLOG, DEFAULT_WORKERS, MAX_POST_ACCEPT,
};
