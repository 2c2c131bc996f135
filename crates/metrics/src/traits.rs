//! Connection metrics and provider traits

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte and chunk counters for one consumer connection
///
/// All fields use atomics for lock-free updates from the connection's reader
/// and writer tasks.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Total bytes read from the peer
    pub bytes_read: AtomicU64,
    /// Total bytes written to the peer
    pub bytes_written: AtomicU64,
    /// Chunks handed to the connection for sending
    pub chunks_sent: AtomicU64,
    /// Chunks parked in a pending queue
    pub chunks_queued: AtomicU64,
    /// Chunks discarded by a slowness policy or eviction
    pub chunks_dropped: AtomicU64,
}

impl ConnectionMetrics {
    /// Create new metrics with all counters at zero
    pub const fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            chunks_queued: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
        }
    }

    /// Record bytes read from the peer
    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes written to the peer
    #[inline]
    pub fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a chunk handed over for sending
    #[inline]
    pub fn record_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk parked in a pending queue
    #[inline]
    pub fn record_queued(&self) {
        self.chunks_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk discarded by policy or eviction
    #[inline]
    pub fn record_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current values
    #[inline]
    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_queued: self.chunks_queued.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of connection metrics
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_sent: u64,
    pub chunks_queued: u64,
    pub chunks_dropped: u64,
}

/// One row of a channel's connection table
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionRow {
    /// Peer channel instance id
    pub remote_id: String,
    /// copy / shared
    pub distribution: String,
    /// wait / drop / queueDrop
    pub slowness: String,
    /// local / remote
    pub memory_location: String,
    /// Local socket address
    pub local_addr: String,
    /// Remote socket address
    pub remote_addr: String,
    /// Counters
    pub snapshot: ConnectionMetricsSnapshot,
}

/// Trait for channels to expose their connection table to the reporter
pub trait ChannelStatsProvider: Send + Sync {
    /// Channel instance id
    fn channel_id(&self) -> &str;

    /// Channel role ("producer" or "consumer")
    fn role(&self) -> &str;

    /// Current connection table
    fn connections(&self) -> Vec<ConnectionRow>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_metrics_snapshot() {
        let metrics = ConnectionMetrics::new();
        metrics.record_read(128);
        metrics.record_written(64);
        metrics.record_written(64);
        metrics.record_sent();
        metrics.record_queued();
        metrics.record_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_read, 128);
        assert_eq!(snapshot.bytes_written, 128);
        assert_eq!(snapshot.chunks_sent, 1);
        assert_eq!(snapshot.chunks_queued, 1);
        assert_eq!(snapshot.chunks_dropped, 1);
    }
}
