//! Error types surfaced by the engine.
//!
//! Only startup can fail from the caller's point of view. Per-connection
//! faults are logged and resolved by dropping the affected session, so they
//! have no public error type.

use std::io;
use thiserror::Error;

/// Reasons `Server::start` can fail.
///
/// The server is left in the `Stopped` state after any of these and `start`
/// may be called again.
#[derive(Debug, Error)]
pub enum StartError {
    /// The configured address and port do not form a valid socket address.
    #[error("invalid listen address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The completion queue or its driver thread could not be created.
    #[error("failed to create completion queue: {0}")]
    CompletionQueue(#[source] io::Error),

    /// Creating, binding or associating the listening socket failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to start worker threads: {0}")]
    Workers(#[source] io::Error),

    /// Not a single accept operation could be pre-posted.
    #[error("failed to post any accept operation")]
    AcceptPool,
}

/// Misuse of a [`Buffer`](crate::Buffer) by application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Tried to consume more bytes than are readable.
    #[error("retrieve of {requested} bytes exceeds {readable} readable bytes")]
    OutOfRange { requested: usize, readable: usize },
}
