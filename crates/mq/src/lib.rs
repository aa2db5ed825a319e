//! Framed, length-delimited message-queue transport over nonblocking stream
//! sockets: a `Connection` drives one socket's send/receive state machine
//! through `turn`/`poll_wants`, either standalone (`Connection::wait`) or
//! multiplexed across many connections through a single [`PollGroup`].
//!
//! Every I/O primitive is nonblocking and cooperative: nothing here spawns a
//! thread or blocks past the caller's chosen timeout.

mod connection;
mod error;
mod frame;
mod link;
mod message;
mod poll;
mod sys;

pub use connection::{ConnState, Connection, GroupId};
pub use error::MqError;
pub use frame::CHUNK;
pub use message::{RecvOutcome, StorageKind};
pub use poll::{ConnToken, PollGroup};

/// Panics in debug builds, logs via `tracing::error!` in release builds.
/// For invariants that indicate a programmer error in the caller (e.g.
/// polling a receive with no sink installed) rather than a transport
/// failure, which always goes through [`MqError`] instead.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else { tracing::error!($($arg)*) })
}
