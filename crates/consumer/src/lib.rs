//! Weir Consumer - the receiving end of a pipeline
//!
//! A `ConsumerChannel` dials zero or more producer channels, performs the
//! hello handshake, and receives chunks over each connection. Records are
//! demultiplexed into per-source and per-train-id indices before the
//! registered data handler runs; end-of-stream fires exactly once per stream
//! epoch after every connected producer has signalled it.
//!
//! # Design
//!
//! - One reader task per connection owns the socket; the data handler is
//!   invoked on that task and is never invoked concurrently with itself
//! - The connection state machine (`Disconnected -> Connecting ->
//!   Connected`) is driven by generation counters and cancellation tokens,
//!   so a connect racing a disconnect resolves deterministically: the
//!   in-flight attempt is canceled, a later connect starts fresh
//! - Records accumulate in an inactive chunk and swap into the active one
//!   when `min_data` is reached, mirroring the producer's chunk scheme

mod channel;
mod demux;
mod error;
mod reader;
mod state;

pub use channel::{ConsumerChannel, ConsumerStatsHandle, RemoteInfo};
pub use error::{ConnectError, ConsumerError};
pub use state::ConnectionStatus;

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

// Test modules - only compiled during testing
#[cfg(test)]
mod demux_test;
