//! Weir Pool - reference-counted chunk arena
//!
//! The chunk pool backs both ends of a pipeline: producers append records
//! into an active chunk and snapshot it on flush; same-host consumers read
//! chunks straight out of the pool instead of deserializing them off the
//! wire.
//!
//! # Design
//!
//! - A pool is an explicit handle (`Arc<ChunkPool>`) passed into every
//!   channel at construction - there is no process-wide singleton, so tests
//!   instantiate independent pools
//! - Every outstanding use of a chunk is an owned [`ChunkLease`]; dropping
//!   the lease decrements the usage count and the chunk is freed exactly when
//!   the count reaches zero
//! - `allocate` never blocks: when the arena is exhausted it returns `None`
//!   and the caller is expected to evict queued chunks and retry

mod error;
mod lease;
mod pool;

pub use error::PoolError;
pub use lease::ChunkLease;
pub use pool::{ChannelId, ChunkId, ChunkPool, DEFAULT_CHUNKS_PER_CHANNEL, DEFAULT_MAX_CHANNELS};

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;
