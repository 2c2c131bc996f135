//! Consumer registry
//!
//! The producer's table of registered consumers, their pending queues, the
//! shared ready-queue, and the shared pending slot. All of it lives behind
//! the channel's state mutex; nothing here performs I/O.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use weir_metrics::{ConnectionMetrics, ConnectionRow};
use weir_pool::ChunkLease;
use weir_protocol::{DistributionClass, MemoryLocation, SlownessPolicy};

/// One dispatch decision's ownership of a chunk
///
/// Dropping a `Pending` releases the chunk usage taken for that decision.
pub(crate) struct Pending {
    pub lease: ChunkLease,
    pub end_of_stream: bool,
}

impl Pending {
    pub fn duplicate(&self) -> Self {
        Self {
            lease: self.lease.clone(),
            end_of_stream: self.end_of_stream,
        }
    }
}

/// A wait-policy send parked until its consumer reports readiness
///
/// Dropping the `done` sender (consumer disconnected) resolves the flush
/// waiter with a cancellation instead of leaving it hanging.
pub(crate) struct BlockedSend {
    pub pending: Pending,
    pub done: oneshot::Sender<()>,
}

/// Work handed to a consumer's writer task
pub(crate) struct Outgoing {
    pub pending: Pending,
    /// Send pool coordinates instead of serialized records
    pub local: bool,
}

/// A registered consumer connection
pub(crate) struct ConsumerEntry {
    pub id: String,
    pub class: DistributionClass,
    pub policy: SlownessPolicy,
    pub memory_location: MemoryLocation,
    pub max_queue_length: usize,

    /// Consumer has reported readiness and nothing is in flight
    pub ready: bool,

    /// Pending chunks for this consumer (copy queueDrop backlog, and the
    /// end-of-stream marker for shared consumers)
    pub queue: VecDeque<Pending>,

    /// Wait-policy sends blocked on this consumer
    pub blocked: VecDeque<BlockedSend>,

    /// Leases pinned for same-pool zero-copy sends, released when the
    /// consumer acknowledges with its next update
    pub held_local: Vec<ChunkLease>,

    /// Writer task inbox
    pub writer: mpsc::Sender<Outgoing>,

    /// Connection generation, used to ignore stale disconnects
    pub generation: u64,

    /// Cancels the connection's reader task on supersede/teardown
    pub conn_cancel: CancellationToken,

    pub peer: SocketAddr,
    pub local_addr: SocketAddr,
    pub metrics: Arc<ConnectionMetrics>,
}

impl ConsumerEntry {
    /// Release every resource this registration holds
    ///
    /// Queued and blocked leases drop here; flush waiters observe the
    /// dropped oneshot senders as cancellation.
    pub fn release(mut self) {
        self.queue.clear();
        self.blocked.clear();
        self.held_local.clear();
        self.conn_cancel.cancel();
        // Dropping `writer` closes the writer task's inbox and with it the
        // socket's write half.
    }

    pub fn stats_row(&self) -> ConnectionRow {
        ConnectionRow {
            remote_id: self.id.clone(),
            distribution: self.class.as_str().into(),
            slowness: self.policy.as_str().into(),
            memory_location: self.memory_location.as_str().into(),
            local_addr: self.local_addr.to_string(),
            remote_addr: self.peer.to_string(),
            snapshot: self.metrics.snapshot(),
        }
    }
}

/// The producer's registration tables
#[derive(Default)]
pub(crate) struct Registry {
    /// Registered consumers by id
    pub consumers: HashMap<String, ConsumerEntry>,

    /// Ready shared consumers in load-balancing order
    pub share_next: VecDeque<String>,

    /// Chunks queued for whichever shared consumer becomes ready next
    pub shared_pending: VecDeque<Pending>,

    /// Wait-policy sends blocked until any shared consumer becomes ready
    pub shared_blocked: VecDeque<BlockedSend>,
}

impl Registry {
    /// Ids of currently registered shared consumers
    pub fn shared_ids(&self) -> Vec<String> {
        self.consumers
            .values()
            .filter(|e| e.class == DistributionClass::Shared)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Whether any shared consumer is registered
    pub fn has_shared(&self) -> bool {
        self.consumers
            .values()
            .any(|e| e.class == DistributionClass::Shared)
    }

    /// Remove a consumer, but only if the registration still belongs to the
    /// given connection generation
    ///
    /// A disconnect from a superseded connection must not tear down the
    /// registration its replacement installed.
    pub fn remove_if_generation(&mut self, id: &str, generation: u64) -> Option<ConsumerEntry> {
        match self.consumers.get(id) {
            Some(entry) if entry.generation == generation => {
                self.share_next.retain(|x| x != id);
                self.consumers.remove(id)
            }
            _ => None,
        }
    }

    /// Drop a consumer id from the shared ready-queue
    pub fn remove_from_share_next(&mut self, id: &str) {
        self.share_next.retain(|x| x != id);
    }

    /// Drain the shared pending queue and block slot, releasing their leases
    pub fn drain_shared(&mut self) {
        self.shared_pending.clear();
        self.shared_blocked.clear();
    }

    /// Tear down every registration
    pub fn clear(&mut self) {
        for (_, entry) in self.consumers.drain() {
            entry.release();
        }
        self.share_next.clear();
        self.drain_shared();
    }

    /// Connection table rows for the statistics surface
    pub fn stats_rows(&self) -> Vec<ConnectionRow> {
        self.consumers.values().map(|e| e.stats_row()).collect()
    }
}
