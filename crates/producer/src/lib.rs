//! Weir Producer - the sending end of a pipeline
//!
//! A `ProducerChannel` owns a listening socket. Consumers connect, introduce
//! themselves with a hello handshake, and are registered as *copy* (receive
//! everything) or *shared* (one of a load-balanced pool). Application code
//! writes records into the channel's active chunk; `flush` snapshots the
//! chunk and dispatches it to every eligible consumer according to its
//! distribution class and slowness policy.
//!
//! # Design
//!
//! - Dispatch decisions happen under a single short critical section; all
//!   socket I/O happens outside it on per-consumer writer tasks
//! - Every dispatch decision owns a `ChunkLease`; completion, failure, and
//!   disconnection all release usage by dropping the lease
//! - At most one chunk send is in flight per consumer connection; the
//!   consumer's `update` message opens the window for the next one
//! - End-of-stream markers are never dropped and are always the last thing
//!   a consumer receives for a stream epoch

mod channel;
mod connection;
mod dispatch;
mod error;
mod registry;

pub use channel::{ConsumerSelector, ProducerChannel, ProducerStatsHandle};
pub use error::ProducerError;

/// Result type for producer operations
pub type Result<T> = std::result::Result<T, ProducerError>;

#[cfg(test)]
mod registry_test;
