//! Producer channel
//!
//! Owns the listening socket and the dispatch state. Consumers connect and
//! hello; application code writes records and flushes. See the crate docs
//! for the concurrency model.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weir_config::{resolve_bind_address, ProducerConfig};
use weir_metrics::{
    ChannelStatsProvider, ConnectionMetrics, ConnectionRow, ReporterConfig, StatsReporter,
};
use weir_pool::{ChannelId, ChunkPool};
use weir_protocol::{
    decode_frame, DistributionClass, Hello, Record, SchemaValidator, ValidateMode, WireMessage,
};

use crate::connection::{self, WRITER_QUEUE_DEPTH};
use crate::dispatch::{self, SelectorFn, SendPlan};
use crate::registry::{ConsumerEntry, Pending, Registry};
use crate::{ProducerError, Result};

/// Picks the shared consumer for a dispatch, overriding load balancing
pub type ConsumerSelector = Box<SelectorFn>;

/// How long a synchronous wrapper waits before logging that it is stuck
const SYNC_WAIT_WARNING: Duration = Duration::from_secs(5);

/// Bounded retries when the pool is exhausted and in-flight sends must drain
const EXHAUSTED_RETRIES: u32 = 100;

struct ProducerState {
    /// The chunk `write` appends into; `None` after an allocation failure
    active: Option<weir_pool::ChunkLease>,
    registry: Registry,
    selector: Option<ConsumerSelector>,
}

struct Inner {
    config: ProducerConfig,
    pool: Arc<ChunkPool>,
    channel_id: ChannelId,
    local_addr: SocketAddr,
    state: Mutex<ProducerState>,
    validator: Mutex<Option<Arc<dyn SchemaValidator>>>,
    /// First-record validation already ran this stream epoch
    validated: AtomicBool,
    next_generation: AtomicU64,
    cancel: CancellationToken,
    disabled: AtomicBool,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ProducerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Swap the active chunk for a fresh one, evicting queued chunks if the
    /// pool is exhausted
    ///
    /// Returns the closed-out chunk, or `None` when there was nothing to
    /// dispatch. `PoolExhausted` means even eviction could not free a slot;
    /// the caller releases the lock and lets in-flight sends complete.
    fn rotate_active(&self) -> Result<Option<Pending>> {
        let mut state = self.lock_state();

        if let Some(active) = &state.active {
            if active.size()? == 0 && !active.is_end_of_stream()? {
                return Ok(None);
            }
        }

        loop {
            match self.pool.allocate(self.channel_id)? {
                Some(fresh) => {
                    let old = state.active.replace(fresh);
                    return Ok(old.map(|lease| {
                        let end_of_stream = lease.is_end_of_stream().unwrap_or(false);
                        Pending {
                            lease,
                            end_of_stream,
                        }
                    }));
                }
                None => {
                    if !dispatch::evict_one(&mut state.registry) {
                        return Err(ProducerError::PoolExhausted);
                    }
                }
            }
        }
    }

    /// Make sure an active chunk exists, evicting if necessary
    fn ensure_active(&self) -> Result<()> {
        let mut state = self.lock_state();
        while state.active.is_none() {
            match self.pool.allocate(self.channel_id)? {
                Some(lease) => state.active = Some(lease),
                None => {
                    if !dispatch::evict_one(&mut state.registry) {
                        return Err(ProducerError::PoolExhausted);
                    }
                }
            }
        }
        Ok(())
    }
}

/// The sending end of a pipeline
///
/// Created with [`ProducerChannel::bind`]; torn down with
/// [`ProducerChannel::disable`] or by dropping.
pub struct ProducerChannel {
    inner: Arc<Inner>,
}

impl ProducerChannel {
    /// Bind the listening socket and start accepting consumers
    ///
    /// The pool handle is explicit: every channel is constructed against the
    /// pool it should allocate from. Port 0 binds an ephemeral port; the
    /// actual address is available from [`local_addr`](Self::local_addr).
    pub async fn bind(config: ProducerConfig, pool: Arc<ChunkPool>) -> Result<Self> {
        config.validate()?;
        let ip = resolve_bind_address(&config.hostname)?;
        let bind_addr = SocketAddr::new(ip, config.port);

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProducerError::Bind {
                address: bind_addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        let channel_id = pool.register_channel()?;
        let active = pool.allocate(channel_id)?;
        let update_period = config.update_period;

        let inner = Arc::new(Inner {
            config,
            pool,
            channel_id,
            local_addr,
            state: Mutex::new(ProducerState {
                active,
                registry: Registry::default(),
                selector: None,
            }),
            validator: Mutex::new(None),
            validated: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            disabled: AtomicBool::new(false),
        });

        tokio::spawn(accept_loop(Arc::clone(&inner), listener));

        let reporter = StatsReporter::builder()
            .config(ReporterConfig {
                interval: update_period,
                ..Default::default()
            })
            .provider(Arc::new(ProducerStatsHandle {
                inner: Arc::clone(&inner),
            }))
            .build();
        tokio::spawn(reporter.run(inner.cancel.clone()));

        tracing::info!(
            producer = %inner.config.id,
            address = %local_addr,
            "producer channel listening"
        );

        Ok(Self { inner })
    }

    /// Producer channel instance id
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// The address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The pool channel backing this producer (for observability)
    pub fn pool_channel(&self) -> ChannelId {
        self.inner.channel_id
    }

    /// Number of currently registered consumers
    pub fn consumer_count(&self) -> usize {
        self.inner.lock_state().registry.consumers.len()
    }

    /// Install the schema validation collaborator
    ///
    /// Validation runs at `write` per the configured mode (once per stream
    /// or for every record).
    pub fn set_validator(&self, validator: Arc<dyn SchemaValidator>) {
        let mut slot = match self.inner.validator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(validator);
    }

    /// Override the default load balancing of shared consumers
    ///
    /// The selector is called once per dispatch decision with the ids of
    /// currently registered shared consumers; returning `None` or a
    /// not-ready id falls back to the channel's no-shared-input policy.
    pub fn register_consumer_selector(&self, selector: ConsumerSelector) {
        self.inner.lock_state().selector = Some(selector);
    }

    /// Statistics provider handle for an external reporter
    pub fn stats_handle(&self) -> ProducerStatsHandle {
        ProducerStatsHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Append a record into the active chunk; no network I/O happens here
    pub fn write(&self, record: Record) -> Result<()> {
        if self.inner.disabled.load(Ordering::SeqCst) {
            return Err(ProducerError::Disabled);
        }
        self.validate_record(&record)?;

        // A previous rotation may have failed; eviction can free a slot.
        self.inner.ensure_active()?;
        let state = self.inner.lock_state();
        match &state.active {
            Some(lease) => {
                lease.write(record)?;
                Ok(())
            }
            None => Err(ProducerError::PoolExhausted),
        }
    }

    /// Snapshot the active chunk and dispatch it to every eligible consumer
    ///
    /// `buffer_safe = false` forces a defensive copy of raw-buffer
    /// attachments before any queueing or same-pool delivery, because the
    /// caller may reuse its buffers as soon as this returns control.
    ///
    /// The returned future completes once every wait-policy consumer has
    /// accepted the chunk; immediate and queued deliveries complete
    /// asynchronously.
    pub async fn flush(&self, buffer_safe: bool) -> Result<()> {
        if self.inner.disabled.load(Ordering::SeqCst) {
            return Err(ProducerError::Disabled);
        }

        let mut attempts = 0u32;
        let pending = loop {
            match self.inner.rotate_active() {
                Ok(pending) => break pending,
                Err(ProducerError::PoolExhausted) if attempts < EXHAUSTED_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(e) => return Err(e),
            }
        };
        let Some(pending) = pending else {
            return Ok(());
        };

        if !buffer_safe {
            pending.lease.force_copy_of_referenced_buffers()?;
        }

        let outcome = {
            let mut state = self.inner.lock_state();
            let ProducerState {
                registry, selector, ..
            } = &mut *state;
            dispatch::plan_dispatch(
                registry,
                pending,
                self.inner.config.no_input_shared,
                self.inner.config.max_queue_length,
                selector.as_deref(),
            )
        };

        for plan in outcome.plans {
            execute_plan(plan);
        }
        for waiter in outcome.waiters {
            // A dropped sender means the consumer disconnected; its usage is
            // already released, nothing further to wait for.
            let _ = waiter.await;
        }
        Ok(())
    }

    /// Flush pending data, then dispatch an end-of-stream marker
    ///
    /// Every live consumer - copy and shared alike - eventually observes
    /// exactly one end-of-stream notification; the marker is never dropped
    /// and is the last thing a consumer receives for this stream epoch.
    pub async fn signal_end_of_stream(&self) -> Result<()> {
        self.flush(true).await?;
        {
            self.inner.ensure_active()?;
            let state = self.inner.lock_state();
            if let Some(active) = &state.active {
                active.mark_end_of_stream()?;
            }
        }
        self.flush(true).await?;
        // The next stream epoch revalidates its first record.
        self.inner.validated.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Synchronous wrapper around [`flush`](Self::flush)
    ///
    /// Blocks the calling thread only; the worker's queue is handed to
    /// another thread so the shared execution context keeps running. Logs a
    /// warning every few seconds while waiting on slow consumers. Requires
    /// the multi-thread runtime.
    pub fn flush_sync(&self, buffer_safe: bool) -> Result<()> {
        block_on_with_warning("flush", self.flush(buffer_safe))
    }

    /// Synchronous wrapper around [`signal_end_of_stream`](Self::signal_end_of_stream)
    pub fn signal_end_of_stream_sync(&self) -> Result<()> {
        block_on_with_warning("signalEndOfStream", self.signal_end_of_stream())
    }

    /// Close the listener and every consumer connection
    ///
    /// Idempotent. Queued and in-flight chunk usage is released; the pool
    /// channel is returned.
    pub fn disable(&self) {
        if self.inner.disabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        {
            let mut state = self.inner.lock_state();
            state.active = None;
            state.registry.clear();
        }
        self.inner.pool.unregister_channel(self.inner.channel_id);
        tracing::info!(producer = %self.inner.config.id, "producer channel disabled");
    }

    fn validate_record(&self, record: &Record) -> Result<()> {
        let validator = {
            let slot = match self.inner.validator.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.clone()
        };
        let Some(validator) = validator else {
            return Ok(());
        };

        let run = match self.inner.config.validate_schema {
            ValidateMode::Always => true,
            ValidateMode::Once => !self.inner.validated.load(Ordering::Relaxed),
        };
        if run {
            validator
                .validate(record)
                .map_err(ProducerError::SchemaRejected)?;
            self.inner.validated.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for ProducerChannel {
    fn drop(&mut self) {
        self.disable();
    }
}

impl std::fmt::Debug for ProducerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerChannel")
            .field("id", &self.inner.config.id)
            .field("local_addr", &self.inner.local_addr)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

/// Statistics surface for a producer channel
pub struct ProducerStatsHandle {
    inner: Arc<Inner>,
}

impl ChannelStatsProvider for ProducerStatsHandle {
    fn channel_id(&self) -> &str {
        &self.inner.config.id
    }

    fn role(&self) -> &str {
        "producer"
    }

    fn connections(&self) -> Vec<ConnectionRow> {
        self.inner.lock_state().registry.stats_rows()
    }
}

/// Block the calling thread on a future, warning while it waits
fn block_on_with_warning<T>(
    operation: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::block_in_place(|| {
        handle.block_on(async {
            let started = Instant::now();
            tokio::pin!(fut);
            loop {
                match tokio::time::timeout(SYNC_WAIT_WARNING, &mut fut).await {
                    Ok(result) => return result,
                    Err(_) => {
                        tracing::warn!(
                            operation,
                            waited_secs = started.elapsed().as_secs(),
                            "synchronous wrapper still waiting on slow consumers"
                        );
                    }
                }
            }
        })
    })
}

/// Hand a planned send to its writer task
fn execute_plan(plan: SendPlan) {
    if plan.writer.try_send(plan.outgoing).is_err() {
        // Writer gone or saturated - the consumer is on its way out and the
        // dropped outgoing releases the chunk usage.
        tracing::debug!(consumer = %plan.consumer_id, "writer unavailable, releasing chunk");
    }
}

/// Accept consumers until cancellation
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    connection::configure_socket(&stream);
                    tokio::spawn(handle_connection(Arc::clone(&inner), stream, peer));
                }
                Err(e) => {
                    // Transient accept errors - log and continue
                    tracing::warn!(error = %e, "accept error");
                }
            }
        }
    }
    tracing::debug!(producer = %inner.config.id, "accept loop stopped");
}

/// Serve one consumer connection: hello, updates, disconnect cleanup
async fn handle_connection(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let conn_cancel = inner.cancel.child_token();
    let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
    let metrics = Arc::new(ConnectionMetrics::new());
    let (mut rd, wr) = stream.into_split();
    let mut wr_slot = Some(wr);
    let mut registered: Option<String> = None;
    let mut buf = BytesMut::with_capacity(64 * 1024);

    'conn: loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break 'conn,
            result = rd.read_buf(&mut buf) => {
                match result {
                    Ok(0) => break 'conn,
                    Ok(n) => {
                        metrics.record_read(n as u64);
                        loop {
                            match decode_frame(&mut buf) {
                                Ok(Some(frame)) => {
                                    if !handle_frame(
                                        &inner,
                                        frame.message,
                                        peer,
                                        local_addr,
                                        generation,
                                        &conn_cancel,
                                        &metrics,
                                        &mut wr_slot,
                                        &mut registered,
                                    ) {
                                        break 'conn;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(peer = %peer, error = %e, "protocol error, closing connection");
                                    break 'conn;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            tracing::debug!(peer = %peer, error = %e, "connection error");
                        }
                        break 'conn;
                    }
                }
            }
        }
    }

    // Disconnect cleanup: deregister and release everything this consumer
    // still owned. A superseded registration has a newer generation and is
    // left alone.
    if let Some(id) = registered {
        let removed = {
            let mut state = inner.lock_state();
            let entry = state.registry.remove_if_generation(&id, generation);
            let was_shared = entry
                .as_ref()
                .map(|e| e.class == DistributionClass::Shared)
                .unwrap_or(false);
            if was_shared && !state.registry.has_shared() {
                // The sole shared consumer left; nobody will drain these.
                state.registry.drain_shared();
            }
            entry
        };
        if let Some(entry) = removed {
            tracing::info!(consumer = %id, peer = %peer, "consumer disconnected");
            entry.release();
        }
    }
}

/// Process one frame from a consumer; false closes the connection
#[allow(clippy::too_many_arguments)]
fn handle_frame(
    inner: &Arc<Inner>,
    message: WireMessage,
    peer: SocketAddr,
    local_addr: SocketAddr,
    generation: u64,
    conn_cancel: &CancellationToken,
    metrics: &Arc<ConnectionMetrics>,
    wr_slot: &mut Option<OwnedWriteHalf>,
    registered: &mut Option<String>,
) -> bool {
    match message {
        WireMessage::Hello(hello) => {
            if registered.as_deref() == Some(hello.consumer_id.as_str()) {
                // Same socket re-hello: update policies in place.
                let mut state = inner.lock_state();
                if let Some(entry) = state.registry.consumers.get_mut(&hello.consumer_id) {
                    if entry.generation == generation {
                        entry.policy = hello.slowness_policy;
                        entry.memory_location = hello.memory_location;
                        if hello.max_queue_length > 0 {
                            entry.max_queue_length = hello.max_queue_length;
                        }
                    }
                }
                return true;
            }
            if registered.is_some() {
                tracing::warn!(peer = %peer, "second hello with a different id, closing connection");
                return false;
            }
            let Some(wr) = wr_slot.take() else {
                return false;
            };
            let plan = register_consumer(
                inner,
                hello,
                wr,
                peer,
                local_addr,
                generation,
                conn_cancel.clone(),
                Arc::clone(metrics),
                registered,
            );
            if let Some(plan) = plan {
                execute_plan(plan);
            }
            true
        }
        WireMessage::Update(update) => {
            if registered.as_deref() != Some(update.consumer_id.as_str()) {
                tracing::warn!(peer = %peer, consumer = %update.consumer_id, "update before hello");
                return true;
            }
            let plan = {
                let mut state = inner.lock_state();
                dispatch::on_consumer_ready(&mut state.registry, &update.consumer_id)
            };
            if let Some(plan) = plan {
                execute_plan(plan);
            }
            true
        }
        WireMessage::Data(_) => {
            tracing::warn!(peer = %peer, "unexpected data frame from consumer, closing connection");
            false
        }
    }
}

/// Register a consumer from its hello, superseding any prior registration
///
/// The superseded registration's connection is closed, but its pending queue
/// carries over - data queued before a reconnect, notably end-of-stream,
/// must still reach the consumer. Hello implies readiness, so a one-shot
/// dispatch attempt runs immediately.
#[allow(clippy::too_many_arguments)]
fn register_consumer(
    inner: &Arc<Inner>,
    hello: Hello,
    wr: OwnedWriteHalf,
    peer: SocketAddr,
    local_addr: SocketAddr,
    generation: u64,
    conn_cancel: CancellationToken,
    metrics: Arc<ConnectionMetrics>,
    registered: &mut Option<String>,
) -> Option<SendPlan> {
    let (writer, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    tokio::spawn(connection::writer_task(
        hello.consumer_id.clone(),
        writer_rx,
        wr,
        Arc::clone(&metrics),
    ));

    let max_queue_length = if hello.max_queue_length > 0 {
        hello.max_queue_length
    } else {
        inner.config.max_queue_length
    };
    let mut entry = ConsumerEntry {
        id: hello.consumer_id.clone(),
        class: hello.distribution_class,
        policy: hello.slowness_policy,
        memory_location: hello.memory_location,
        max_queue_length,
        ready: false,
        queue: VecDeque::new(),
        blocked: VecDeque::new(),
        held_local: Vec::new(),
        writer,
        generation,
        conn_cancel,
        peer,
        local_addr,
        metrics,
    };

    tracing::info!(
        consumer = %entry.id,
        class = %entry.class,
        policy = %entry.policy,
        memory = %entry.memory_location,
        peer = %peer,
        "consumer registered"
    );

    let mut state = inner.lock_state();
    if let Some(mut old) = state.registry.consumers.remove(&hello.consumer_id) {
        tracing::info!(consumer = %hello.consumer_id, "superseding prior registration");
        std::mem::swap(&mut entry.queue, &mut old.queue);
        std::mem::swap(&mut entry.blocked, &mut old.blocked);
        state.registry.remove_from_share_next(&hello.consumer_id);
        old.release();
    }
    state.registry.consumers.insert(entry.id.clone(), entry);
    *registered = Some(hello.consumer_id.clone());

    dispatch::on_consumer_ready(&mut state.registry, &hello.consumer_id)
}
