//! Record - the unit of data flowing through a channel
//!
//! A record is a structured payload plus zero or more raw buffer attachments,
//! tagged with its source and a logical train id. Payload and attachments are
//! `bytes::Bytes`, so cloning a record is O(1) and shares the underlying
//! allocations - this is what makes same-host zero-copy delivery observable.

use bytes::Bytes;

/// Metadata attached to every record
///
/// The train id is monotonic per source but may reset when the source
/// restarts; consumers demultiplex batches on both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    /// Identifier of the producing source
    pub source: String,

    /// Logical timestamp / train id
    pub train_id: u64,
}

impl RecordMeta {
    /// Create record metadata
    pub fn new(source: impl Into<String>, train_id: u64) -> Self {
        Self {
            source: source.into(),
            train_id,
        }
    }
}

/// A single record: structured payload plus raw buffer attachments
///
/// The structured payload is an opaque encoded blob whose encoding lives
/// with the application schema; attachments carry large binary data that may
/// be handed to a same-host consumer without copying.
#[derive(Debug, Clone)]
pub struct Record {
    /// Record metadata (source, train id)
    pub meta: RecordMeta,

    /// Structured part of the payload
    pub payload: Bytes,

    /// Raw buffer attachments
    pub attachments: Vec<Bytes>,
}

impl Record {
    /// Create a record without attachments
    pub fn new(meta: RecordMeta, payload: impl Into<Bytes>) -> Self {
        Self {
            meta,
            payload: payload.into(),
            attachments: Vec::new(),
        }
    }

    /// Create a record with raw buffer attachments
    pub fn with_attachments(
        meta: RecordMeta,
        payload: impl Into<Bytes>,
        attachments: Vec<Bytes>,
    ) -> Self {
        Self {
            meta,
            payload: payload.into(),
            attachments,
        }
    }

    /// Total payload size including attachments, in bytes
    pub fn total_bytes(&self) -> usize {
        self.payload.len() + self.attachments.iter().map(Bytes::len).sum::<usize>()
    }

    /// Number of raw buffer attachments
    #[inline]
    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Replace payload and attachments with freshly-owned copies
    ///
    /// After this call the record no longer references any caller-owned
    /// memory; used when the caller may mutate or free its buffers before
    /// the send completes.
    pub fn detach_buffers(&mut self) {
        self.payload = Bytes::copy_from_slice(&self.payload);
        for buf in &mut self.attachments {
            *buf = Bytes::copy_from_slice(buf);
        }
    }
}
