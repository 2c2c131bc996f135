//! Wire framing
//!
//! Every message is a length-prefixed header followed by a length-prefixed
//! buffer list:
//!
//! ```text
//! [4 bytes: header len (BE)][header JSON]
//! [4 bytes: buffer count (BE)]
//! per buffer: [4 bytes: len (BE)][bytes]
//! ```
//!
//! Decoding is incremental: `decode_frame` inspects the accumulated read
//! buffer and returns `None` until a complete frame is available, letting the
//! connection task read in whatever sized gulps the socket delivers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::WireMessage;
use crate::ProtocolError;

/// Maximum frame header size (1 MiB)
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Maximum single raw buffer size (256 MiB)
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Length prefix size (4 bytes, big-endian u32)
const LEN_PREFIX: usize = 4;

/// A decoded wire frame: header plus raw buffers
#[derive(Debug, Clone)]
pub struct Frame {
    /// The message header
    pub message: WireMessage,

    /// Raw buffers following the header
    pub buffers: Vec<Bytes>,
}

impl Frame {
    /// Frame without raw buffers
    pub fn new(message: WireMessage) -> Self {
        Self {
            message,
            buffers: Vec::new(),
        }
    }

    /// Frame carrying raw buffers
    pub fn with_buffers(message: WireMessage, buffers: Vec<Bytes>) -> Self {
        Self { message, buffers }
    }
}

/// Encode a frame into a single contiguous buffer
pub fn encode_frame(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let header = serde_json::to_vec(&frame.message)?;
    if header.len() > MAX_HEADER_SIZE {
        return Err(ProtocolError::header_too_large(header.len()));
    }
    for buf in &frame.buffers {
        if buf.len() > MAX_BUFFER_SIZE {
            return Err(ProtocolError::buffer_too_large(buf.len()));
        }
    }

    let total = LEN_PREFIX
        + header.len()
        + LEN_PREFIX
        + frame
            .buffers
            .iter()
            .map(|b| LEN_PREFIX + b.len())
            .sum::<usize>();
    let mut out = BytesMut::with_capacity(total);

    out.put_u32(header.len() as u32);
    out.put_slice(&header);
    out.put_u32(frame.buffers.len() as u32);
    for buf in &frame.buffers {
        out.put_u32(buf.len() as u32);
        out.put_slice(buf);
    }

    Ok(out.freeze())
}

/// Try to decode one frame from the front of the accumulated read buffer
///
/// Returns:
/// - `Ok(Some(frame))` - a complete frame was consumed from `buf`
/// - `Ok(None)` - more data is needed; `buf` is untouched
/// - `Err` - the stream is corrupt; the connection must be closed
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    // Walk the prefix chain without consuming, to find the full frame extent.
    let mut offset = 0;

    let Some(header_len) = peek_u32(buf, offset) else {
        return Ok(None);
    };
    let header_len = header_len as usize;
    if header_len > MAX_HEADER_SIZE {
        return Err(ProtocolError::header_too_large(header_len));
    }
    offset += LEN_PREFIX + header_len;

    let Some(buf_count) = peek_u32(buf, offset) else {
        return Ok(None);
    };
    offset += LEN_PREFIX;

    let mut buffer_lens = Vec::with_capacity(buf_count as usize);
    for _ in 0..buf_count {
        let Some(len) = peek_u32(buf, offset) else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_BUFFER_SIZE {
            return Err(ProtocolError::buffer_too_large(len));
        }
        buffer_lens.push(len);
        offset += LEN_PREFIX + len;
    }

    if buf.len() < offset {
        return Ok(None);
    }

    // Whole frame present - now consume it.
    buf.advance(LEN_PREFIX);
    let header_bytes = buf.split_to(header_len);
    let message: WireMessage = serde_json::from_slice(&header_bytes)?;

    buf.advance(LEN_PREFIX);
    let mut buffers = Vec::with_capacity(buffer_lens.len());
    for len in buffer_lens {
        buf.advance(LEN_PREFIX);
        buffers.push(buf.split_to(len).freeze());
    }

    Ok(Some(Frame { message, buffers }))
}

/// Peek a big-endian u32 at `offset` without consuming
fn peek_u32(buf: &BytesMut, offset: usize) -> Option<u32> {
    if buf.len() < offset + LEN_PREFIX {
        return None;
    }
    Some(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}
