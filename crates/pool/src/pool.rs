//! Chunk arena
//!
//! A fixed table of channels, each holding a fixed table of chunk slots.
//! Channel ids are recycled through a lock-free free-list; chunk slots are
//! recycled through a per-channel free-list guarded by that channel's mutex.
//! No lock is ever held across I/O - callers snapshot what they need and
//! release.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use weir_protocol::{DataHeader, Record};

use crate::lease::ChunkLease;
use crate::{PoolError, Result};

/// Default number of channel slots per pool
pub const DEFAULT_MAX_CHANNELS: usize = 64;

/// Default number of chunk slots per channel
pub const DEFAULT_CHUNKS_PER_CHANNEL: usize = 512;

/// Identifies a registered channel within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a chunk slot within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u16);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chunk slot
#[derive(Default)]
struct ChunkSlot {
    in_use: bool,
    usage: u32,
    end_of_stream: bool,
    records: Vec<Record>,
}

/// Per-channel chunk table
struct ChannelTable {
    active: bool,
    /// Bumped on every register; leases carry the epoch they were minted
    /// under, so a lease surviving past unregister cannot touch a recycled
    /// channel's counters
    epoch: u64,
    slots: Vec<ChunkSlot>,
    free: VecDeque<u16>,
}

impl ChannelTable {
    fn new(chunks: usize) -> Self {
        Self {
            active: false,
            epoch: 0,
            slots: (0..chunks).map(|_| ChunkSlot::default()).collect(),
            free: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.free.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            *slot = ChunkSlot::default();
            self.free.push_back(i as u16);
        }
    }
}

/// Reference-counted chunk arena
///
/// See the crate docs for the ownership model. All methods take `&self`;
/// the pool is meant to live in an `Arc` shared by every channel using it.
pub struct ChunkPool {
    channels: Vec<Mutex<ChannelTable>>,
    free_channels: ArrayQueue<u16>,
    chunks_per_channel: usize,
}

impl ChunkPool {
    /// Create a pool with explicit capacity
    pub fn new(max_channels: usize, chunks_per_channel: usize) -> Arc<Self> {
        let free_channels = ArrayQueue::new(max_channels);
        for i in 0..max_channels {
            // Filling an empty queue cannot fail
            let _ = free_channels.push(i as u16);
        }
        Arc::new(Self {
            channels: (0..max_channels)
                .map(|_| Mutex::new(ChannelTable::new(chunks_per_channel)))
                .collect(),
            free_channels,
            chunks_per_channel,
        })
    }

    /// Create a pool with default capacity
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_MAX_CHANNELS, DEFAULT_CHUNKS_PER_CHANNEL)
    }

    /// Number of chunk slots each channel owns
    #[inline]
    pub fn chunks_per_channel(&self) -> usize {
        self.chunks_per_channel
    }

    /// Register a channel, claiming one channel slot
    pub fn register_channel(&self) -> Result<ChannelId> {
        let id = self
            .free_channels
            .pop()
            .ok_or(PoolError::ChannelsExhausted {
                max: self.channels.len(),
            })?;
        let mut table = self.lock_table(id);
        table.reset();
        table.active = true;
        table.epoch += 1;
        tracing::debug!(channel = id, "pool channel registered");
        Ok(ChannelId(id))
    }

    /// Unregister a channel, freeing every chunk it still holds
    ///
    /// Idempotent: unregistering an inactive channel is a no-op.
    pub fn unregister_channel(&self, channel: ChannelId) {
        let mut table = self.lock_table(channel.0);
        if !table.active {
            return;
        }
        let leaked = table.slots.iter().filter(|s| s.in_use).count();
        if leaked > 0 {
            tracing::debug!(
                channel = %channel,
                chunks = leaked,
                "releasing live chunks on channel unregister"
            );
        }
        table.active = false;
        table.reset();
        drop(table);
        // Cannot overflow: each id is pushed back at most once per register
        let _ = self.free_channels.push(channel.0);
        tracing::debug!(channel = %channel, "pool channel unregistered");
    }

    /// Allocate a fresh chunk on a channel
    ///
    /// Returns `Ok(None)` when the channel's chunk table is exhausted - the
    /// pool never blocks; eviction is the caller's responsibility. The
    /// returned lease carries the chunk's initial usage count of one.
    pub fn allocate(self: &Arc<Self>, channel: ChannelId) -> Result<Option<ChunkLease>> {
        let mut table = self.lock_table(channel.0);
        if !table.active {
            return Err(PoolError::UnknownChannel(channel));
        }
        let Some(idx) = table.free.pop_front() else {
            return Ok(None);
        };
        let epoch = table.epoch;
        let slot = &mut table.slots[idx as usize];
        slot.in_use = true;
        slot.usage = 1;
        slot.end_of_stream = false;
        slot.records.clear();
        drop(table);
        Ok(Some(ChunkLease::new(
            Arc::clone(self),
            channel,
            ChunkId(idx),
            epoch,
        )))
    }

    /// Append a record to a chunk
    pub fn write(&self, channel: ChannelId, chunk: ChunkId, record: Record) -> Result<()> {
        self.with_slot_mut(channel, chunk, |slot| {
            slot.records.push(record);
        })
    }

    /// Append several already-decoded records to a chunk
    pub fn append_records(
        &self,
        channel: ChannelId,
        chunk: ChunkId,
        records: Vec<Record>,
    ) -> Result<()> {
        self.with_slot_mut(channel, chunk, |slot| {
            slot.records.extend(records);
        })
    }

    /// Clear a chunk's records without releasing the slot
    ///
    /// Used by consumers that keep two long-lived chunks and alternate
    /// between them.
    pub fn clear_records(&self, channel: ChannelId, chunk: ChunkId) -> Result<()> {
        self.with_slot_mut(channel, chunk, |slot| {
            slot.records.clear();
            slot.end_of_stream = false;
        })
    }

    /// Flag a chunk as an end-of-stream marker
    ///
    /// Flagged chunks are never evicted by backpressure-driven dropping.
    pub fn mark_end_of_stream(&self, channel: ChannelId, chunk: ChunkId) -> Result<()> {
        self.with_slot_mut(channel, chunk, |slot| {
            slot.end_of_stream = true;
        })
    }

    /// Whether a chunk carries the end-of-stream flag
    pub fn is_end_of_stream(&self, channel: ChannelId, chunk: ChunkId) -> Result<bool> {
        self.with_slot_mut(channel, chunk, |slot| slot.end_of_stream)
    }

    /// Number of records in a chunk
    pub fn size(&self, channel: ChannelId, chunk: ChunkId) -> Result<usize> {
        self.with_slot_mut(channel, chunk, |slot| slot.records.len())
    }

    /// Current usage count of a chunk slot; zero means the slot is free
    pub fn usage(&self, channel: ChannelId, chunk: ChunkId) -> u32 {
        let table = self.lock_table(channel.0);
        table
            .slots
            .get(chunk.0 as usize)
            .map(|s| s.usage)
            .unwrap_or(0)
    }

    /// Number of chunks currently allocated on a channel
    pub fn live_chunks(&self, channel: ChannelId) -> usize {
        let table = self.lock_table(channel.0);
        table.slots.iter().filter(|s| s.in_use).count()
    }

    /// Read a copy of a chunk's records
    ///
    /// Record payloads are `Bytes`, so this clones reference counts, not
    /// data - the same-host zero-copy path.
    pub fn read_records(&self, channel: ChannelId, chunk: ChunkId) -> Result<Vec<Record>> {
        self.with_slot_mut(channel, chunk, |slot| slot.records.clone())
    }

    /// Serialize a chunk for wire transfer
    ///
    /// Produces the data header and the flat buffer list a frame carries.
    pub fn read_into(&self, channel: ChannelId, chunk: ChunkId) -> Result<(DataHeader, Vec<Bytes>)> {
        self.with_slot_mut(channel, chunk, |slot| {
            DataHeader::pack_records(&slot.records, slot.end_of_stream)
        })
    }

    /// Replace a chunk's record buffers with freshly-owned copies
    ///
    /// Used when a raw-buffer attachment cannot be guaranteed to outlive the
    /// send, e.g. because it will be queued or delivered without copy to an
    /// in-process consumer.
    pub fn force_copy_of_referenced_buffers(
        &self,
        channel: ChannelId,
        chunk: ChunkId,
    ) -> Result<()> {
        self.with_slot_mut(channel, chunk, |slot| {
            for record in &mut slot.records {
                record.detach_buffers();
            }
        })
    }

    /// Increment a chunk's usage count (lease clone)
    pub(crate) fn increment_usage(&self, channel: ChannelId, chunk: ChunkId, epoch: u64) {
        let mut table = self.lock_table(channel.0);
        if !table.active || table.epoch != epoch {
            return;
        }
        let slot = &mut table.slots[chunk.0 as usize];
        if !slot.in_use {
            tracing::error!(channel = %channel, chunk = %chunk, "usage increment on free chunk");
            return;
        }
        slot.usage += 1;
    }

    /// Decrement a chunk's usage count, freeing the slot at zero (lease drop)
    pub(crate) fn decrement_usage(&self, channel: ChannelId, chunk: ChunkId, epoch: u64) {
        let mut table = self.lock_table(channel.0);
        if !table.active || table.epoch != epoch {
            // Channel was torn down (and possibly recycled) underneath an
            // outstanding lease; the reset already freed the slot.
            return;
        }
        let slot = &mut table.slots[chunk.0 as usize];
        if !slot.in_use || slot.usage == 0 {
            tracing::error!(channel = %channel, chunk = %chunk, "usage decrement on free chunk");
            return;
        }
        slot.usage -= 1;
        if slot.usage == 0 {
            slot.in_use = false;
            slot.end_of_stream = false;
            slot.records = Vec::new();
            table.free.push_back(chunk.0);
            tracing::trace!(channel = %channel, chunk = %chunk, "chunk freed");
        }
    }

    fn with_slot_mut<T>(
        &self,
        channel: ChannelId,
        chunk: ChunkId,
        f: impl FnOnce(&mut ChunkSlot) -> T,
    ) -> Result<T> {
        let mut table = self.lock_table(channel.0);
        if !table.active {
            return Err(PoolError::UnknownChannel(channel));
        }
        let slot = table
            .slots
            .get_mut(chunk.0 as usize)
            .filter(|s| s.in_use)
            .ok_or(PoolError::ChunkNotAllocated { channel, chunk })?;
        Ok(f(slot))
    }

    fn lock_table(&self, idx: u16) -> MutexGuard<'_, ChannelTable> {
        // Lock poisoning would mean a panic inside one of the short critical
        // sections above; propagating the inner state is still sound.
        match self.channels[idx as usize].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPool")
            .field("max_channels", &self.channels.len())
            .field("chunks_per_channel", &self.chunks_per_channel)
            .field("free_channels", &self.free_channels.len())
            .finish()
    }
}
