//! Weir Protocol - Core types for the weir streaming pipeline
//!
//! This crate provides the foundational types that flow between producer and
//! consumer channels:
//! - `Record` / `RecordMeta` - the unit of data moving through a channel
//! - `DistributionClass` / `SlownessPolicy` / `MemoryLocation` - consumer
//!   policy tokens carried in the handshake
//! - `WireMessage` - hello / update / data headers
//! - `Frame` - the length-prefixed wire framing (header + raw buffers)
//! - `SchemaValidator` - the narrow boundary to the schema/validation engine
//!
//! # Design Principles
//!
//! - **Zero-copy**: record payloads and attachments are `bytes::Bytes`, so
//!   cloning a record shares the underlying allocation
//! - **Self-describing headers**: frame headers are small tagged JSON objects;
//!   bulk data travels as raw buffers after the header
//! - **Tolerant reader**: legacy policy tokens are normalized, not rejected

mod error;
mod frame;
mod policy;
mod record;
mod schema;
mod wire;

pub use error::ProtocolError;
pub use frame::{decode_frame, encode_frame, Frame, MAX_BUFFER_SIZE, MAX_HEADER_SIZE};
pub use policy::{DistributionClass, MemoryLocation, SlownessPolicy};
pub use record::{Record, RecordMeta};
pub use schema::{RecordSchema, SchemaValidator, ValidateMode};
pub use wire::{DataHeader, Hello, RecordHeader, Update, WireMessage};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
