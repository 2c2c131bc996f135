//! Connection state
//!
//! One slot per configured remote, carrying the observable status, a
//! generation counter, and the cancellation token of the current attempt or
//! live connection. The generation counter is what makes races
//! deterministic: disconnect bumps it, and any in-flight work that still
//! carries the old generation finds itself stale and stands down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use weir_metrics::ConnectionMetrics;

use crate::channel::RemoteInfo;

/// Observable status of one (consumer, remote producer) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection and no attempt in flight
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Handshake sent, data flowing
    Connected,
}

impl ConnectionStatus {
    /// String form for logging and trackers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-remote connection slot
pub(crate) struct RemoteSlot {
    pub status: ConnectionStatus,

    /// Bumped by every new attempt and every disconnect; work holding a
    /// stale generation must not mutate the slot
    pub generation: u64,

    /// Cancels the in-flight attempt or the live reader task
    pub cancel: CancellationToken,

    pub endpoint: RemoteInfo,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub metrics: Arc<ConnectionMetrics>,
}

impl RemoteSlot {
    pub fn new(endpoint: RemoteInfo) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            cancel: CancellationToken::new(),
            endpoint,
            peer: None,
            local: None,
            metrics: Arc::new(ConnectionMetrics::new()),
        }
    }
}
