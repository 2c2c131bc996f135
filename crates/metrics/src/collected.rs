//! Collected statistics snapshot

use crate::traits::ConnectionRow;

/// Connection table of one channel at collection time
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectedChannel {
    /// Channel instance id
    pub id: String,
    /// "producer" or "consumer"
    pub role: String,
    /// Connection table rows
    pub connections: Vec<ConnectionRow>,
}

/// Everything the reporter gathered in one collection pass
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CollectedStats {
    /// Per-channel connection tables
    pub channels: Vec<CollectedChannel>,
}

impl CollectedStats {
    /// Total number of connections across all channels
    pub fn connection_count(&self) -> usize {
        self.channels.iter().map(|c| c.connections.len()).sum()
    }
}
