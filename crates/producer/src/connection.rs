//! Consumer connection I/O
//!
//! Each registered consumer gets one writer task owning the socket's write
//! half. The task serializes chunks and writes frames; because dispatch only
//! hands it work after the consumer's update, at most one send is ever in
//! flight per connection.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use weir_metrics::ConnectionMetrics;
use weir_protocol::{encode_frame, DataHeader, Frame, WireMessage};

use crate::registry::Outgoing;

/// Writer task inbox depth
///
/// The update protocol keeps this at one occupied slot; the headroom absorbs
/// a readiness report racing an in-progress send.
pub(crate) const WRITER_QUEUE_DEPTH: usize = 4;

/// Run a consumer connection's writer task until its inbox closes
pub(crate) async fn writer_task(
    consumer_id: String,
    mut rx: mpsc::Receiver<Outgoing>,
    mut wr: OwnedWriteHalf,
    metrics: Arc<ConnectionMetrics>,
) {
    while let Some(outgoing) = rx.recv().await {
        let frame = match build_frame(&outgoing) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(consumer = %consumer_id, error = %e, "failed to serialize chunk");
                continue;
            }
        };
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(consumer = %consumer_id, error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = wr.write_all(&bytes).await {
            tracing::debug!(consumer = %consumer_id, error = %e, "write failed, closing connection");
            break;
        }
        metrics.record_written(bytes.len() as u64);
        // The outgoing lease drops here: the send is complete.
    }
    let _ = wr.shutdown().await;
    tracing::debug!(consumer = %consumer_id, "writer task stopped");
}

/// Serialize one dispatch decision into a wire frame
fn build_frame(outgoing: &Outgoing) -> weir_pool::Result<Frame> {
    let lease = &outgoing.pending.lease;
    if outgoing.local {
        // Same-pool consumer reads the chunk out of the pool; the frame
        // carries coordinates only.
        let header = DataHeader::local(
            lease.channel().0,
            lease.chunk().0,
            outgoing.pending.end_of_stream,
        );
        Ok(Frame::new(WireMessage::Data(header)))
    } else {
        let (header, buffers) = lease.read_into()?;
        Ok(Frame::with_buffers(WireMessage::Data(header), buffers))
    }
}

/// Tune an accepted socket: disable Nagle, enable keepalive
///
/// Both are best-effort; a failure is logged and the connection proceeds
/// with defaults.
pub(crate) fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(60));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to set TCP keepalive");
    }
}
