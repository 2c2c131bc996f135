//! Chunk leases
//!
//! A `ChunkLease` is one owned reference to a pool chunk. Every dispatch
//! decision (send, queue, block) clones the lease; every completed,
//! abandoned, or superseded delivery drops its clone. The chunk is freed
//! exactly when the last lease drops, which removes the need to audit every
//! error path for a missing usage decrement.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use weir_protocol::{DataHeader, Record};

use crate::pool::{ChannelId, ChunkId, ChunkPool};
use crate::Result;

/// Owned reference to one pool chunk
pub struct ChunkLease {
    pool: Arc<ChunkPool>,
    channel: ChannelId,
    chunk: ChunkId,
    /// Channel epoch this lease was minted under
    epoch: u64,
}

impl ChunkLease {
    pub(crate) fn new(pool: Arc<ChunkPool>, channel: ChannelId, chunk: ChunkId, epoch: u64) -> Self {
        Self {
            pool,
            channel,
            chunk,
            epoch,
        }
    }

    /// Channel this lease belongs to
    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Chunk this lease refers to
    #[inline]
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// The pool backing this lease
    #[inline]
    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Append a record to the chunk
    pub fn write(&self, record: Record) -> Result<()> {
        self.pool.write(self.channel, self.chunk, record)
    }

    /// Append several records to the chunk
    pub fn append_records(&self, records: Vec<Record>) -> Result<()> {
        self.pool.append_records(self.channel, self.chunk, records)
    }

    /// Clear the chunk's records without releasing the slot
    pub fn clear_records(&self) -> Result<()> {
        self.pool.clear_records(self.channel, self.chunk)
    }

    /// Flag the chunk as an end-of-stream marker
    pub fn mark_end_of_stream(&self) -> Result<()> {
        self.pool.mark_end_of_stream(self.channel, self.chunk)
    }

    /// Whether the chunk carries the end-of-stream flag
    pub fn is_end_of_stream(&self) -> Result<bool> {
        self.pool.is_end_of_stream(self.channel, self.chunk)
    }

    /// Number of records in the chunk
    pub fn size(&self) -> Result<usize> {
        self.pool.size(self.channel, self.chunk)
    }

    /// Read a copy of the chunk's records (cheap - payloads are `Bytes`)
    pub fn read_records(&self) -> Result<Vec<Record>> {
        self.pool.read_records(self.channel, self.chunk)
    }

    /// Serialize the chunk for wire transfer
    pub fn read_into(&self) -> Result<(DataHeader, Vec<Bytes>)> {
        self.pool.read_into(self.channel, self.chunk)
    }

    /// Replace the chunk's record buffers with freshly-owned copies
    pub fn force_copy_of_referenced_buffers(&self) -> Result<()> {
        self.pool
            .force_copy_of_referenced_buffers(self.channel, self.chunk)
    }

    /// Current usage count of the chunk
    pub fn usage(&self) -> u32 {
        self.pool.usage(self.channel, self.chunk)
    }
}

impl Clone for ChunkLease {
    fn clone(&self) -> Self {
        self.pool.increment_usage(self.channel, self.chunk, self.epoch);
        Self {
            pool: Arc::clone(&self.pool),
            channel: self.channel,
            chunk: self.chunk,
            epoch: self.epoch,
        }
    }
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        self.pool.decrement_usage(self.channel, self.chunk, self.epoch);
    }
}

impl fmt::Debug for ChunkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkLease")
            .field("channel", &self.channel)
            .field("chunk", &self.chunk)
            .field("usage", &self.usage())
            .finish()
    }
}
