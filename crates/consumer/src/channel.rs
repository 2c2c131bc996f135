//! Consumer channel
//!
//! Public API: connect/disconnect with typed failures, handler registration,
//! and the batch read interface used inside data callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use weir_config::{ConsumerConfig, RemoteEndpoint};
use weir_metrics::{ChannelStatsProvider, ConnectionRow};
use weir_pool::{ChannelId, ChunkLease, ChunkPool};
use weir_protocol::{MemoryLocation, Record, RecordMeta};

use crate::demux::DemuxIndex;
use crate::reader;
use crate::state::{ConnectionStatus, RemoteSlot};
use crate::{ConnectError, ConsumerError, Result};

/// Dial timeout for a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to reach one remote producer channel
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    /// Remote producer channel id
    pub id: String,
    /// Transport token; only "tcp" is supported
    pub connection_type: String,
    /// Remote host
    pub hostname: String,
    /// Remote port
    pub port: u16,
    /// Whether the remote shares this consumer's memory pool
    pub memory_location: MemoryLocation,
}

impl RemoteInfo {
    /// A tcp remote with serialized (non-shared-pool) delivery
    pub fn tcp(id: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            connection_type: "tcp".into(),
            hostname: hostname.into(),
            port,
            memory_location: MemoryLocation::Remote,
        }
    }

    /// Switch the remote to same-pool zero-copy delivery
    #[must_use]
    pub fn with_local_memory(mut self) -> Self {
        self.memory_location = MemoryLocation::Local;
        self
    }

    /// Host:port pair for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl From<&RemoteEndpoint> for RemoteInfo {
    fn from(endpoint: &RemoteEndpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            connection_type: "tcp".into(),
            hostname: endpoint.hostname.clone(),
            port: endpoint.port,
            memory_location: endpoint.memory_location,
        }
    }
}

pub(crate) type DataHandlerFn = dyn Fn(&ConsumerChannel) + Send + Sync;
pub(crate) type TrackerFn = dyn Fn(&str, ConnectionStatus) + Send + Sync;

#[derive(Default)]
pub(crate) struct Handlers {
    pub data: Option<Arc<DataHandlerFn>>,
    pub end_of_stream: Option<Arc<DataHandlerFn>>,
    pub tracker: Option<Arc<TrackerFn>>,
}

pub(crate) struct ConsumerState {
    pub remotes: HashMap<String, RemoteSlot>,

    /// The pot the batch API reads; `None` only after teardown
    pub active: Option<ChunkLease>,

    /// The pot incoming records accumulate into; `None` only after teardown
    pub inactive: Option<ChunkLease>,

    /// The delivered batch, extracted at swap time
    pub batch: Vec<Record>,
    pub demux: DemuxIndex,

    /// Remotes that sent end-of-stream this epoch
    pub eos_seen: HashSet<String>,
}

impl ConsumerState {
    /// Number of currently connected remotes
    pub fn connected_count(&self) -> usize {
        self.remotes
            .values()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .count()
    }

    /// Whether any remote is connecting or connected
    pub fn any_active(&self) -> bool {
        self.remotes
            .values()
            .any(|s| s.status != ConnectionStatus::Disconnected)
    }

    /// Records accumulated in the inactive pot
    pub fn buffered(&self) -> usize {
        self.inactive
            .as_ref()
            .and_then(|pot| pot.size().ok())
            .unwrap_or(0)
    }

    /// Append decoded records to the inactive pot
    pub fn store(&mut self, records: Vec<Record>) -> weir_pool::Result<()> {
        match &self.inactive {
            Some(pot) => pot.append_records(records),
            None => Ok(()),
        }
    }

    /// Clear the old batch, swap pots, and index the fresh one
    pub fn swap_pots(&mut self) -> weir_pool::Result<()> {
        if self.active.is_none() || self.inactive.is_none() {
            return Ok(());
        }
        if let Some(active) = &self.active {
            active.clear_records()?;
        }
        std::mem::swap(&mut self.active, &mut self.inactive);
        self.batch = match &self.active {
            Some(active) => active.read_records()?,
            None => Vec::new(),
        };
        self.demux = DemuxIndex::build(&self.batch);
        Ok(())
    }
}

pub(crate) struct Inner {
    pub config: Mutex<ConsumerConfig>,
    pub pool: Arc<ChunkPool>,
    pub channel_id: ChannelId,
    pub state: Mutex<ConsumerState>,
    pub handlers: Mutex<Handlers>,
    /// Serializes pot swaps and handler invocations across connections, so
    /// the data handler is never invoked concurrently with itself and the
    /// batch it reads stays put for the duration of the callback
    pub delivery: Mutex<()>,
    pub cancel: CancellationToken,
    pub disabled: AtomicBool,
}

impl Inner {
    pub fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        match self.delivery.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, ConsumerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn lock_config(&self) -> MutexGuard<'_, ConsumerConfig> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn data_handler(&self) -> Option<Arc<DataHandlerFn>> {
        self.lock_handlers().data.clone()
    }

    pub fn eos_handler(&self) -> Option<Arc<DataHandlerFn>> {
        self.lock_handlers().end_of_stream.clone()
    }

    pub fn notify_tracker(&self, remote_id: &str, status: ConnectionStatus) {
        let tracker = self.lock_handlers().tracker.clone();
        if let Some(tracker) = tracker {
            tracker(remote_id, status);
        }
    }
}

/// The receiving end of a pipeline
///
/// Created with [`ConsumerChannel::new`]; torn down with
/// [`ConsumerChannel::disable`] - the lifecycle collaborator owns teardown,
/// so dropping without disabling leaves connections to the cancellation
/// token's mercy.
pub struct ConsumerChannel {
    inner: Arc<Inner>,
}

impl ConsumerChannel {
    /// Create a consumer channel against an explicit pool
    ///
    /// No I/O happens here; connections are made with
    /// [`connect`](Self::connect) or [`connect_configured`](Self::connect_configured).
    pub fn new(config: ConsumerConfig, pool: Arc<ChunkPool>) -> Result<Self> {
        config.validate()?;
        let channel_id = pool.register_channel()?;
        let active = pool
            .allocate(channel_id)?
            .ok_or(weir_pool::PoolError::ChunkNotAllocated {
                channel: channel_id,
                chunk: weir_pool::ChunkId(0),
            })?;
        let inactive = pool
            .allocate(channel_id)?
            .ok_or(weir_pool::PoolError::ChunkNotAllocated {
                channel: channel_id,
                chunk: weir_pool::ChunkId(0),
            })?;

        tracing::debug!(
            consumer = %config.id,
            channel = %channel_id,
            "consumer channel created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                pool,
                channel_id,
                state: Mutex::new(ConsumerState {
                    remotes: HashMap::new(),
                    active: Some(active),
                    inactive: Some(inactive),
                    batch: Vec::new(),
                    demux: DemuxIndex::default(),
                    eos_seen: HashSet::new(),
                }),
                handlers: Mutex::new(Handlers::default()),
                delivery: Mutex::new(()),
                cancel: CancellationToken::new(),
                disabled: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Consumer channel instance id
    pub fn id(&self) -> String {
        self.inner.lock_config().id.clone()
    }

    /// The pool channel backing this consumer (for observability)
    pub fn pool_channel(&self) -> ChannelId {
        self.inner.channel_id
    }

    /// Observable status of a remote
    pub fn status(&self, remote_id: &str) -> ConnectionStatus {
        self.inner
            .lock_state()
            .remotes
            .get(remote_id)
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Ids of currently connected remotes
    pub fn connected_remotes(&self) -> Vec<String> {
        self.inner
            .lock_state()
            .remotes
            .iter()
            .filter(|(_, s)| s.status == ConnectionStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Register the data callback
    ///
    /// Must happen while no connection is active; the callback runs on the
    /// task servicing the delivering connection and is never invoked
    /// concurrently with itself.
    pub fn register_data_handler(
        &self,
        handler: impl Fn(&ConsumerChannel) + Send + Sync + 'static,
    ) -> Result<()> {
        self.guard_handler_registration()?;
        self.inner.lock_handlers().data = Some(Arc::new(handler));
        Ok(())
    }

    /// Register the end-of-stream callback
    pub fn register_end_of_stream_handler(
        &self,
        handler: impl Fn(&ConsumerChannel) + Send + Sync + 'static,
    ) -> Result<()> {
        self.guard_handler_registration()?;
        self.inner.lock_handlers().end_of_stream = Some(Arc::new(handler));
        Ok(())
    }

    /// Register the connection status tracker
    pub fn register_connection_tracker(
        &self,
        tracker: impl Fn(&str, ConnectionStatus) + Send + Sync + 'static,
    ) -> Result<()> {
        self.guard_handler_registration()?;
        self.inner.lock_handlers().tracker = Some(Arc::new(tracker));
        Ok(())
    }

    /// Connect to a remote producer channel
    ///
    /// Resolves with success or a specific [`ConnectError`]. Concurrent
    /// connects to the same target yield exactly one success; a disconnect
    /// racing the attempt cancels it (`Canceled`), and a later connect
    /// starts fresh.
    pub async fn connect(&self, remote: RemoteInfo) -> std::result::Result<(), ConnectError> {
        if self.inner.disabled.load(Ordering::SeqCst) {
            return Err(ConnectError::Canceled);
        }
        if remote.connection_type != "tcp" {
            return Err(ConnectError::UnsupportedTransport(remote.connection_type));
        }
        if remote.id.is_empty() {
            return Err(ConnectError::MissingField("id"));
        }
        if remote.hostname.is_empty() {
            return Err(ConnectError::MissingField("hostname"));
        }
        if remote.port == 0 {
            return Err(ConnectError::BadPort);
        }
        {
            let config = self.inner.lock_config();
            if !config.connected_remotes.is_empty()
                && !config.connected_remotes.iter().any(|r| r.id == remote.id)
            {
                return Err(ConnectError::UnknownRemote(remote.id));
            }
        }

        let (generation, attempt_cancel) = {
            let mut state = self.inner.lock_state();
            let slot = state
                .remotes
                .entry(remote.id.clone())
                .or_insert_with(|| RemoteSlot::new(remote.clone()));
            match slot.status {
                ConnectionStatus::Connected => return Err(ConnectError::AlreadyConnected),
                ConnectionStatus::Connecting => return Err(ConnectError::AlreadyConnecting),
                ConnectionStatus::Disconnected => {
                    slot.generation += 1;
                    slot.status = ConnectionStatus::Connecting;
                    slot.cancel = self.inner.cancel.child_token();
                    slot.endpoint = remote.clone();
                    (slot.generation, slot.cancel.clone())
                }
            }
        };
        self.inner
            .notify_tracker(&remote.id, ConnectionStatus::Connecting);

        let target = remote.address();
        let dialed = tokio::select! {
            _ = attempt_cancel.cancelled() => Err(ConnectError::Canceled),
            result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)) => {
                match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(ConnectError::Unreachable {
                        target: target.clone(),
                        source: e,
                    }),
                    Err(_) => Err(ConnectError::Timeout {
                        target: target.clone(),
                    }),
                }
            }
        };

        let stream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                let rolled_back = {
                    let mut state = self.inner.lock_state();
                    match state.remotes.get_mut(&remote.id) {
                        Some(slot)
                            if slot.generation == generation
                                && slot.status == ConnectionStatus::Connecting =>
                        {
                            slot.status = ConnectionStatus::Disconnected;
                            true
                        }
                        _ => false,
                    }
                };
                if rolled_back {
                    self.inner
                        .notify_tracker(&remote.id, ConnectionStatus::Disconnected);
                }
                tracing::debug!(remote = %remote.id, error = %e, "connect attempt failed");
                return Err(e);
            }
        };

        configure_socket(&stream);

        // Commit: a disconnect may have raced the dial; the stale generation
        // tells us to stand down without touching the slot.
        let metrics = {
            let mut state = self.inner.lock_state();
            match state.remotes.get_mut(&remote.id) {
                Some(slot)
                    if slot.generation == generation
                        && slot.status == ConnectionStatus::Connecting
                        && !attempt_cancel.is_cancelled() =>
                {
                    slot.status = ConnectionStatus::Connected;
                    slot.peer = stream.peer_addr().ok();
                    slot.local = stream.local_addr().ok();
                    Some(Arc::clone(&slot.metrics))
                }
                _ => None,
            }
        };
        let Some(metrics) = metrics else {
            tracing::debug!(remote = %remote.id, "connect canceled at commit");
            return Err(ConnectError::Canceled);
        };

        self.inner
            .notify_tracker(&remote.id, ConnectionStatus::Connected);
        tracing::info!(remote = %remote.id, target = %target, "connected to producer");

        tokio::spawn(reader::reader_task(
            Arc::clone(&self.inner),
            remote,
            generation,
            stream,
            attempt_cancel,
            metrics,
        ));
        Ok(())
    }

    /// Connect to every remote in the registration table
    ///
    /// Returns one result per configured remote, in table order.
    pub async fn connect_configured(
        &self,
    ) -> Vec<(String, std::result::Result<(), ConnectError>)> {
        let remotes: Vec<RemoteInfo> = {
            let config = self.inner.lock_config();
            config.connected_remotes.iter().map(RemoteInfo::from).collect()
        };
        let mut results = Vec::with_capacity(remotes.len());
        for remote in remotes {
            let id = remote.id.clone();
            results.push((id, self.connect(remote).await));
        }
        results
    }

    /// Disconnect from a remote
    ///
    /// Cancels any in-flight connect attempt to the same target; idempotent
    /// for unknown or already-disconnected remotes. The registration table
    /// is not modified.
    pub fn disconnect(&self, remote_id: &str) {
        let notify = {
            let mut state = self.inner.lock_state();
            state.eos_seen.remove(remote_id);
            match state.remotes.get_mut(remote_id) {
                Some(slot) if slot.status != ConnectionStatus::Disconnected => {
                    slot.cancel.cancel();
                    slot.status = ConnectionStatus::Disconnected;
                    slot.generation += 1;
                    slot.peer = None;
                    slot.local = None;
                    true
                }
                _ => false,
            }
        };
        if notify {
            tracing::info!(remote = %remote_id, "disconnect requested");
            self.inner
                .notify_tracker(remote_id, ConnectionStatus::Disconnected);
        }
    }

    /// Replace the configuration, including the output registration table
    ///
    /// Rejected while any connection is active.
    pub fn reconfigure(&self, config: ConsumerConfig) -> Result<()> {
        config.validate()?;
        let state = self.inner.lock_state();
        if state.any_active() {
            return Err(ConsumerError::ReconfigureWhileActive);
        }
        // Swapped under the state lock so no connect can slip in between
        // the check and the new table taking effect.
        *self.inner.lock_config() = config;
        Ok(())
    }

    /// Number of records in the batch delivered to the current callback
    pub fn size(&self) -> usize {
        self.inner.lock_state().batch.len()
    }

    /// Read one record of the delivered batch
    pub fn read(&self, index: usize) -> Option<Record> {
        self.inner.lock_state().batch.get(index).cloned()
    }

    /// Metadata of one record of the delivered batch
    pub fn index_to_metadata(&self, index: usize) -> Option<RecordMeta> {
        self.inner
            .lock_state()
            .batch
            .get(index)
            .map(|r| r.meta.clone())
    }

    /// Indices of the batch records coming from one source
    pub fn source_to_indices(&self, source: &str) -> Vec<usize> {
        self.inner.lock_state().demux.source_indices(source)
    }

    /// Indices of the batch records carrying one train id
    pub fn train_id_to_indices(&self, train_id: u64) -> Vec<usize> {
        self.inner.lock_state().demux.train_indices(train_id)
    }

    /// Statistics provider handle for an external reporter
    pub fn stats_handle(&self) -> ConsumerStatsHandle {
        ConsumerStatsHandle {
            id: self.id(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Close every connection and release the pool channel
    ///
    /// Idempotent. In-flight connect attempts resolve `Canceled`; their
    /// callers still observe the outcome.
    pub fn disable(&self) {
        if self.inner.disabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let notified: Vec<String> = {
            let mut state = self.inner.lock_state();
            state.eos_seen.clear();
            state.batch.clear();
            state.demux = DemuxIndex::default();
            state.active = None;
            state.inactive = None;
            state
                .remotes
                .iter_mut()
                .filter(|(_, slot)| slot.status != ConnectionStatus::Disconnected)
                .map(|(id, slot)| {
                    slot.status = ConnectionStatus::Disconnected;
                    slot.generation += 1;
                    slot.peer = None;
                    slot.local = None;
                    id.clone()
                })
                .collect()
        };
        for id in notified {
            self.inner
                .notify_tracker(&id, ConnectionStatus::Disconnected);
        }
        self.inner.pool.unregister_channel(self.inner.channel_id);
        tracing::info!(consumer = %self.id(), "consumer channel disabled");
    }

    fn guard_handler_registration(&self) -> Result<()> {
        if self.inner.lock_state().any_active() {
            return Err(ConsumerError::HandlersLocked);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerChannel")
            .field("id", &self.id())
            .field("connected", &self.connected_remotes())
            .finish()
    }
}

/// Statistics surface for a consumer channel
pub struct ConsumerStatsHandle {
    id: String,
    inner: Arc<Inner>,
}

impl ChannelStatsProvider for ConsumerStatsHandle {
    fn channel_id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> &str {
        "consumer"
    }

    fn connections(&self) -> Vec<ConnectionRow> {
        let (distribution, slowness) = {
            let config = self.inner.lock_config();
            (
                config.data_distribution.as_str().to_string(),
                config.on_slowness.as_str().to_string(),
            )
        };
        let state = self.inner.lock_state();
        state
            .remotes
            .iter()
            .filter(|(_, slot)| slot.status == ConnectionStatus::Connected)
            .map(|(id, slot)| ConnectionRow {
                remote_id: id.clone(),
                distribution: distribution.clone(),
                slowness: slowness.clone(),
                memory_location: slot.endpoint.memory_location.as_str().into(),
                local_addr: slot
                    .local
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                remote_addr: slot.peer.map(|a| a.to_string()).unwrap_or_default(),
                snapshot: slot.metrics.snapshot(),
            })
            .collect()
    }
}

/// Tune a dialed socket: disable Nagle, enable keepalive
fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to set TCP keepalive");
    }
}
