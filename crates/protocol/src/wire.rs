//! Wire messages
//!
//! The three headers exchanged between producer and consumer channels:
//!
//! - `hello` - sent once by the consumer after TCP connect, registering its
//!   identity and policies
//! - `update` - sent by the consumer whenever it is ready for the next chunk
//! - `data` - sent by the producer; either carries serialized records as raw
//!   buffers, or pool coordinates for same-host zero-copy pickup, or an
//!   end-of-stream marker with no payload
//!
//! Headers are tagged JSON objects framed by [`crate::frame`].

use serde::{Deserialize, Serialize};

use crate::policy::{DistributionClass, MemoryLocation, SlownessPolicy};
use crate::record::{Record, RecordMeta};
use crate::{Bytes, ProtocolError};

/// Consumer handshake, sent once after TCP connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Consumer channel instance id
    pub consumer_id: String,

    /// Whether the consumer shares the producer's memory pool
    pub memory_location: MemoryLocation,

    /// Copy or shared distribution
    pub distribution_class: DistributionClass,

    /// Policy when this consumer is slow (copy consumers only; shared
    /// consumers fall under the producer's channel-level policy)
    pub slowness_policy: SlownessPolicy,

    /// Queue bound for the queueDrop policy
    pub max_queue_length: usize,
}

/// Readiness notification, sent whenever the consumer can take the next chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Consumer channel instance id
    pub consumer_id: String,
}

/// Describes one record inside a data frame
///
/// The frame's buffer list is flat; each record owns `1 + attachment_count`
/// consecutive buffers (payload first, then attachments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Source identifier
    pub source: String,

    /// Logical timestamp / train id
    pub train_id: u64,

    /// Number of raw buffer attachments following the payload buffer
    pub attachment_count: usize,
}

/// Producer-to-consumer data header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataHeader {
    /// Pool channel id, present only for same-host zero-copy delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<u16>,

    /// Pool chunk id, present only for same-host zero-copy delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u16>,

    /// End-of-stream marker; true means this is a stream boundary
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end_of_stream: bool,

    /// Per-record layout of the frame's buffer list; empty for zero-copy and
    /// bare end-of-stream frames
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordHeader>,
}

impl DataHeader {
    /// Header for same-host zero-copy delivery
    pub fn local(channel_id: u16, chunk_id: u16, end_of_stream: bool) -> Self {
        Self {
            channel_id: Some(channel_id),
            chunk_id: Some(chunk_id),
            end_of_stream,
            records: Vec::new(),
        }
    }

    /// Bare end-of-stream marker, no payload
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::default()
        }
    }

    /// True when the consumer should read the chunk out of the shared pool
    #[inline]
    pub fn is_local(&self) -> bool {
        self.channel_id.is_some() && self.chunk_id.is_some()
    }

    /// Total number of buffers the frame must carry for this header
    pub fn expected_buffers(&self) -> usize {
        self.records.iter().map(|r| 1 + r.attachment_count).sum()
    }

    /// Reassemble records from the frame's flat buffer list
    pub fn unpack_records(&self, buffers: &[Bytes]) -> Result<Vec<Record>, ProtocolError> {
        let expected = self.expected_buffers();
        if expected != buffers.len() {
            return Err(ProtocolError::BufferCountMismatch {
                expected,
                actual: buffers.len(),
            });
        }

        let mut records = Vec::with_capacity(self.records.len());
        let mut cursor = 0;
        for header in &self.records {
            let payload = buffers[cursor].clone();
            cursor += 1;
            let attachments = buffers[cursor..cursor + header.attachment_count].to_vec();
            cursor += header.attachment_count;
            records.push(Record::with_attachments(
                RecordMeta::new(header.source.clone(), header.train_id),
                payload,
                attachments,
            ));
        }
        Ok(records)
    }

    /// Flatten records into headers plus the frame's buffer list
    pub fn pack_records(records: &[Record], end_of_stream: bool) -> (Self, Vec<Bytes>) {
        let mut headers = Vec::with_capacity(records.len());
        let mut buffers = Vec::with_capacity(records.len());
        for record in records {
            headers.push(RecordHeader {
                source: record.meta.source.clone(),
                train_id: record.meta.train_id,
                attachment_count: record.attachments.len(),
            });
            buffers.push(record.payload.clone());
            buffers.extend(record.attachments.iter().cloned());
        }
        (
            Self {
                channel_id: None,
                chunk_id: None,
                end_of_stream,
                records: headers,
            },
            buffers,
        )
    }
}

/// A framed wire message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Consumer handshake
    Hello(Hello),
    /// Consumer readiness notification
    Update(Update),
    /// Producer data / end-of-stream
    Data(DataHeader),
}
