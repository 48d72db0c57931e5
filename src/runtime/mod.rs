//! Completion-queue runtime.
//!
//! - `port`: the completion queue and the driver thread feeding it
//! - `context`: per-operation contexts and the per-socket pool owning them
//! - `session`: per-connection buffers, send queue and callbacks
//! - `registry`: live sessions keyed by socket
//! - `worker`: threads draining the completion queue
//! - `buffer`: compacting byte buffer for inbound data
//! - `stats`: resource accounting

pub mod buffer;
pub mod context;
pub mod port;
pub mod registry;
pub mod session;
pub mod stats;
pub mod worker;

pub use buffer::{Buffer, DEFAULT_BUFFER_SIZE};
pub use context::{OpKind, SocketId, DEFAULT_RECV_BUFFER_SIZE};
pub use session::{Callbacks, MessageCallback, Session, SessionCallback};
pub use stats::StatsSnapshot;
