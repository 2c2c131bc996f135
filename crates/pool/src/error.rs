//! Pool error types

use thiserror::Error;

use crate::pool::{ChannelId, ChunkId};

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// All channel slots are registered
    #[error("pool channel table exhausted ({max} channels)")]
    ChannelsExhausted { max: usize },

    /// Channel id is not registered with this pool
    #[error("channel {0} is not registered")]
    UnknownChannel(ChannelId),

    /// Chunk slot is not currently allocated
    #[error("chunk {chunk} on channel {channel} is not allocated")]
    ChunkNotAllocated { channel: ChannelId, chunk: ChunkId },
}
