//! Connection reader task
//!
//! One task per live connection owns the socket: it sends the hello,
//! receives data frames, accumulates records into the inactive pot, swaps
//! and delivers when enough data is present, and answers every frame with an
//! update once processing is done. Handler invocations happen on this task,
//! so the data handler is never invoked concurrently with itself.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use weir_metrics::ConnectionMetrics;
use weir_pool::{ChannelId, ChunkId};
use weir_protocol::{
    decode_frame, encode_frame, DataHeader, Frame, Hello, Record, Update, WireMessage,
};

use crate::channel::{ConsumerChannel, Inner, RemoteInfo};
use crate::state::ConnectionStatus;

/// Serve one producer connection until cancellation, EOF, or error
pub(crate) async fn reader_task(
    inner: Arc<Inner>,
    remote: RemoteInfo,
    generation: u64,
    mut stream: TcpStream,
    cancel: CancellationToken,
    metrics: Arc<ConnectionMetrics>,
) {
    let remote_id = remote.id.clone();

    let hello = {
        let config = inner.lock_config();
        Hello {
            consumer_id: config.id.clone(),
            memory_location: remote.memory_location,
            distribution_class: config.data_distribution,
            slowness_policy: config.on_slowness,
            max_queue_length: config.max_queue_length,
        }
    };
    let consumer_id = hello.consumer_id.clone();

    match encode_frame(&Frame::new(WireMessage::Hello(hello))) {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                tracing::debug!(remote = %remote_id, error = %e, "hello failed");
                mark_disconnected(&inner, &remote_id, generation);
                return;
            }
            metrics.record_written(bytes.len() as u64);
        }
        Err(e) => {
            tracing::warn!(remote = %remote_id, error = %e, "failed to encode hello");
            mark_disconnected(&inner, &remote_id, generation);
            return;
        }
    }

    let mut buf = BytesMut::with_capacity(64 * 1024);

    'conn: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'conn,
            result = stream.read_buf(&mut buf) => {
                match result {
                    Ok(0) => break 'conn,
                    Ok(n) => {
                        metrics.record_read(n as u64);
                        loop {
                            match decode_frame(&mut buf) {
                                Ok(Some(frame)) => {
                                    if !process_frame(&inner, &remote_id, frame) {
                                        break 'conn;
                                    }
                                    if !send_update(&inner, &mut stream, &consumer_id, &metrics).await {
                                        break 'conn;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(
                                        remote = %remote_id,
                                        error = %e,
                                        "protocol error, closing connection"
                                    );
                                    break 'conn;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            tracing::debug!(remote = %remote_id, error = %e, "connection error");
                        }
                        break 'conn;
                    }
                }
            }
        }
    }

    mark_disconnected(&inner, &remote_id, generation);
}

/// Process one data frame; false closes the connection
fn process_frame(inner: &Arc<Inner>, remote_id: &str, frame: Frame) -> bool {
    let WireMessage::Data(header) = frame.message else {
        tracing::warn!(remote = %remote_id, "unexpected frame from producer, closing connection");
        return false;
    };

    let records = match gather_records(inner, &header, &frame.buffers) {
        Ok(records) => records,
        Err(()) => return false,
    };

    let (respond_to_eos, min_data) = {
        let config = inner.lock_config();
        (config.respond_to_end_of_stream, config.min_data.max(1))
    };

    // One delivery at a time across all of this channel's connections: the
    // handler must never run concurrently with itself, and the batch must
    // not be swapped out from under it.
    let _delivery = inner.lock_delivery();

    let (deliver_data, deliver_eos) = {
        let mut state = inner.lock_state();
        if !records.is_empty() {
            if let Err(e) = state.store(records) {
                tracing::warn!(remote = %remote_id, error = %e, "failed to store records");
            }
        }

        let mut deliver_data = false;
        let mut deliver_eos = false;
        if header.end_of_stream {
            state.eos_seen.insert(remote_id.to_string());
            let connected = state.connected_count().max(1);
            if state.eos_seen.len() >= connected {
                // Every connected producer has signalled the boundary.
                state.eos_seen.clear();
                if state.buffered() > 0 && state.swap_pots().is_ok() {
                    deliver_data = true;
                }
                deliver_eos = true;
            }
        } else if state.buffered() >= min_data && state.swap_pots().is_ok() {
            deliver_data = true;
        }
        (deliver_data, deliver_eos && respond_to_eos)
    };

    // Handlers run without any lock held; the batch API locks per call.
    if deliver_data {
        if let Some(handler) = inner.data_handler() {
            let view = ConsumerChannel::from_inner(Arc::clone(inner));
            handler(&view);
        }
    }
    if deliver_eos {
        tracing::debug!(remote = %remote_id, "end of stream");
        if let Some(handler) = inner.eos_handler() {
            let view = ConsumerChannel::from_inner(Arc::clone(inner));
            handler(&view);
        }
    }
    true
}

/// Extract the frame's records, from the shared pool or from its buffers
fn gather_records(
    inner: &Arc<Inner>,
    header: &DataHeader,
    buffers: &[weir_protocol::Bytes],
) -> Result<Vec<Record>, ()> {
    if header.is_local() {
        let channel = ChannelId(header.channel_id.unwrap_or_default());
        let chunk = ChunkId(header.chunk_id.unwrap_or_default());
        match inner.pool.read_records(channel, chunk) {
            Ok(records) => Ok(records),
            Err(e) => {
                // The producer releases its pin on our update either way.
                tracing::warn!(error = %e, "shared-pool pickup failed");
                Ok(Vec::new())
            }
        }
    } else if !header.records.is_empty() {
        match header.unpack_records(buffers) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(error = %e, "malformed data frame");
                Err(())
            }
        }
    } else {
        Ok(Vec::new())
    }
}

/// Notify the producer that this consumer is ready for the next chunk
async fn send_update(
    inner: &Arc<Inner>,
    stream: &mut TcpStream,
    consumer_id: &str,
    metrics: &ConnectionMetrics,
) -> bool {
    let delay = inner.lock_config().delay_on_input;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let frame = Frame::new(WireMessage::Update(Update {
        consumer_id: consumer_id.to_string(),
    }));
    match encode_frame(&frame) {
        Ok(bytes) => match stream.write_all(&bytes).await {
            Ok(()) => {
                metrics.record_written(bytes.len() as u64);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "update failed, closing connection");
                false
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode update");
            false
        }
    }
}

/// Flip the slot to Disconnected if this connection still owns it
fn mark_disconnected(inner: &Arc<Inner>, remote_id: &str, generation: u64) {
    let notify = {
        let mut state = inner.lock_state();
        state.eos_seen.remove(remote_id);
        match state.remotes.get_mut(remote_id) {
            Some(slot) if slot.generation == generation => {
                slot.status = ConnectionStatus::Disconnected;
                slot.peer = None;
                slot.local = None;
                true
            }
            _ => false,
        }
    };
    if notify {
        tracing::info!(remote = %remote_id, "disconnected from producer");
        inner.notify_tracker(remote_id, ConnectionStatus::Disconnected);
    }
}
