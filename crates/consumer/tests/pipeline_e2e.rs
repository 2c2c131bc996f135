//! End-to-end pipeline scenarios
//!
//! Producer and consumer channels talking over real loopback sockets:
//! ordering and completeness under the wait policy, shared fan-out,
//! end-of-stream guarantees, zero-copy delivery, reconnect cycles, and the
//! connect/disconnect race rules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use weir_config::{ConsumerConfig, ProducerConfig};
use weir_consumer::{ConnectError, ConnectionStatus, ConsumerChannel, RemoteInfo};
use weir_pool::ChunkPool;
use weir_producer::ProducerChannel;
use weir_protocol::{DistributionClass, Record, RecordMeta, SlownessPolicy};

fn test_pool() -> Arc<ChunkPool> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    ChunkPool::new(8, 64)
}

fn producer_config(id: &str) -> ProducerConfig {
    ProducerConfig {
        id: id.into(),
        hostname: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

fn consumer_config(id: &str, class: DistributionClass, slowness: SlownessPolicy) -> ConsumerConfig {
    ConsumerConfig {
        id: id.into(),
        data_distribution: class,
        on_slowness: slowness,
        ..Default::default()
    }
}

fn record(train_id: u64) -> Record {
    Record::new(RecordMeta::new("src", train_id), Bytes::from_static(b"payload"))
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects delivered train ids and counts end-of-stream events
#[derive(Default)]
struct Sink {
    trains: Mutex<Vec<u64>>,
    eos: AtomicUsize,
}

impl Sink {
    fn attach(self: &Arc<Self>, consumer: &ConsumerChannel) {
        let sink = Arc::clone(self);
        consumer
            .register_data_handler(move |ch| {
                let mut trains = sink.trains.lock().unwrap();
                for i in 0..ch.size() {
                    trains.push(ch.read(i).unwrap().meta.train_id);
                }
            })
            .unwrap();
        let sink = Arc::clone(self);
        consumer
            .register_end_of_stream_handler(move |_| {
                sink.eos.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    fn train_count(&self) -> usize {
        self.trains.lock().unwrap().len()
    }

    fn eos_count(&self) -> usize {
        self.eos.load(Ordering::SeqCst)
    }
}

async fn connect_and_register(
    consumer: &ConsumerChannel,
    producer: &ProducerChannel,
) {
    let before = producer.consumer_count();
    consumer
        .connect(RemoteInfo::tcp(
            producer.id(),
            "127.0.0.1",
            producer.local_addr().port(),
        ))
        .await
        .unwrap();
    // Registration completes when the producer has processed the hello.
    wait_until(
        || producer.consumer_count() > before,
        Duration::from_secs(5),
    )
    .await;
}

// =============================================================================
// Scenario A: copy consumer with wait never loses a record
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_copy_wait_delivers_everything_in_order() {
    const TOTAL: u64 = 100_000;
    const PER_CHUNK: u64 = 200;

    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let consumer = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Wait),
        Arc::clone(&pool),
    )
    .unwrap();

    let sink = Arc::new(Sink::default());
    sink.attach(&consumer);
    connect_and_register(&consumer, &producer).await;

    for train in 0..TOTAL {
        producer.write(record(train)).unwrap();
        if train % PER_CHUNK == PER_CHUNK - 1 {
            producer.flush(true).await.unwrap();
        }
    }
    producer.signal_end_of_stream().await.unwrap();

    wait_until(|| sink.eos_count() == 1, Duration::from_secs(60)).await;

    let trains = sink.trains.lock().unwrap();
    assert_eq!(trains.len(), TOTAL as usize, "wait policy must not drop records");
    for (expected, &got) in trains.iter().enumerate() {
        assert_eq!(got, expected as u64, "records must arrive in dispatch order");
    }
    drop(trains);
    assert_eq!(sink.eos_count(), 1, "end of stream fires exactly once");

    consumer.disable();
    producer.disable();
}

// =============================================================================
// Shared fan-out: each record to exactly one consumer, marker to all
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_consumers_split_stream_and_all_see_end_of_stream() {
    const TOTAL: u64 = 2_000;

    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();

    let consumer_a = ConsumerChannel::new(
        consumer_config("in_a", DistributionClass::Shared, SlownessPolicy::Wait),
        Arc::clone(&pool),
    )
    .unwrap();
    let consumer_b = ConsumerChannel::new(
        consumer_config("in_b", DistributionClass::Shared, SlownessPolicy::Wait),
        Arc::clone(&pool),
    )
    .unwrap();

    let sink_a = Arc::new(Sink::default());
    let sink_b = Arc::new(Sink::default());
    sink_a.attach(&consumer_a);
    sink_b.attach(&consumer_b);

    connect_and_register(&consumer_a, &producer).await;
    connect_and_register(&consumer_b, &producer).await;
    wait_until(|| producer.consumer_count() == 2, Duration::from_secs(5)).await;

    for train in 0..TOTAL {
        producer.write(record(train)).unwrap();
        producer.flush(true).await.unwrap();
    }
    producer.signal_end_of_stream().await.unwrap();

    wait_until(
        || sink_a.eos_count() == 1 && sink_b.eos_count() == 1,
        Duration::from_secs(30),
    )
    .await;

    let mut combined: Vec<u64> = Vec::new();
    combined.extend(sink_a.trains.lock().unwrap().iter());
    combined.extend(sink_b.trains.lock().unwrap().iter());
    combined.sort_unstable();

    // Every dispatched record went to exactly one shared consumer.
    assert_eq!(combined.len(), TOTAL as usize);
    for (expected, &got) in combined.iter().enumerate() {
        assert_eq!(got, expected as u64);
    }
    // Both members of the pool actually participated.
    assert!(sink_a.train_count() > 0, "load balancing starved in_a");
    assert!(sink_b.train_count() > 0, "load balancing starved in_b");

    consumer_a.disable();
    consumer_b.disable();
    producer.disable();
}

// =============================================================================
// Scenario B: mid-stream disconnect with drop policy leaks nothing
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_shared_drop_survives_midstream_disconnect() {
    let pool = test_pool();
    let mut config = producer_config("out0");
    config.no_input_shared = SlownessPolicy::Drop;
    let producer = ProducerChannel::bind(config, Arc::clone(&pool)).await.unwrap();
    let producer_pool_channel = producer.pool_channel();

    let consumer = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Shared, SlownessPolicy::Drop),
        Arc::clone(&pool),
    )
    .unwrap();
    let sink = Arc::new(Sink::default());
    sink.attach(&consumer);
    connect_and_register(&consumer, &producer).await;

    for train in 0..200u64 {
        producer.write(record(train)).unwrap();
        producer.flush(true).await.unwrap();
        if train == 100 {
            consumer.disconnect(&producer.id());
        }
    }

    // Once in-flight sends settle, only the active chunk stays allocated.
    wait_until(
        || pool.live_chunks(producer_pool_channel) <= 1,
        Duration::from_secs(10),
    )
    .await;

    producer.disable();
    consumer.disable();
    assert_eq!(pool.live_chunks(producer_pool_channel), 0);
}

// =============================================================================
// Scenario C: reconnect cycles under load leak nothing and never deadlock
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_reconnect_cycles_do_not_leak_chunks() {
    const CYCLES: usize = 150;

    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let producer_pool_channel = producer.pool_channel();

    let consumer = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Drop),
        Arc::clone(&pool),
    )
    .unwrap();
    let sink = Arc::new(Sink::default());
    sink.attach(&consumer);

    let remote = RemoteInfo::tcp(producer.id(), "127.0.0.1", producer.local_addr().port());

    for cycle in 0..CYCLES {
        consumer.connect(remote.clone()).await.unwrap();
        wait_until(
            || consumer.status(&remote.id) == ConnectionStatus::Connected,
            Duration::from_secs(5),
        )
        .await;

        for train in 0..10u64 {
            producer.write(record(cycle as u64 * 10 + train)).unwrap();
            producer.flush(true).await.unwrap();
        }

        consumer.disconnect(&remote.id);
        wait_until(
            || consumer.status(&remote.id) == ConnectionStatus::Disconnected,
            Duration::from_secs(5),
        )
        .await;
    }

    // Usage returns to the single active chunk between cycles.
    wait_until(
        || pool.live_chunks(producer_pool_channel) <= 1,
        Duration::from_secs(10),
    )
    .await;

    producer.disable();
    consumer.disable();
    assert_eq!(pool.live_chunks(producer_pool_channel), 0);
}

// =============================================================================
// End-of-stream survives drop policies
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_of_stream_is_never_dropped_by_slowness_policy() {
    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();

    let mut config = consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Drop);
    // Slow the consumer down so most chunks hit the drop policy.
    config.delay_on_input = Duration::from_millis(10);
    let consumer = ConsumerChannel::new(config, Arc::clone(&pool)).unwrap();
    let sink = Arc::new(Sink::default());
    sink.attach(&consumer);
    connect_and_register(&consumer, &producer).await;

    for train in 0..100u64 {
        producer.write(record(train)).unwrap();
        producer.flush(true).await.unwrap();
    }
    producer.signal_end_of_stream().await.unwrap();

    wait_until(|| sink.eos_count() == 1, Duration::from_secs(30)).await;
    // Records were droppable, the marker was not.
    assert!(sink.train_count() <= 100);

    consumer.disable();
    producer.disable();
}

// =============================================================================
// Zero-copy round trip through a shared pool
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn buffer_safe_flush_shares_attachment_memory() {
    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let consumer = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Wait),
        Arc::clone(&pool),
    )
    .unwrap();

    let received: Arc<Mutex<Vec<Record>>> = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&received);
    consumer
        .register_data_handler(move |ch| {
            let mut records = store.lock().unwrap();
            for i in 0..ch.size() {
                records.push(ch.read(i).unwrap());
            }
        })
        .unwrap();

    consumer
        .connect(
            RemoteInfo::tcp(producer.id(), "127.0.0.1", producer.local_addr().port())
                .with_local_memory(),
        )
        .await
        .unwrap();
    wait_until(|| producer.consumer_count() == 1, Duration::from_secs(5)).await;

    let shared_attachment = Bytes::from(vec![0xA5u8; 4096]);
    let copied_attachment = Bytes::from(vec![0x5Au8; 4096]);

    producer
        .write(Record::with_attachments(
            RecordMeta::new("cam0", 1),
            Bytes::from_static(b"head"),
            vec![shared_attachment.clone()],
        ))
        .unwrap();
    producer.flush(true).await.unwrap();

    wait_until(|| received.lock().unwrap().len() == 1, Duration::from_secs(5)).await;

    producer
        .write(Record::with_attachments(
            RecordMeta::new("cam0", 2),
            Bytes::from_static(b"head"),
            vec![copied_attachment.clone()],
        ))
        .unwrap();
    producer.flush(false).await.unwrap();

    wait_until(|| received.lock().unwrap().len() == 2, Duration::from_secs(5)).await;

    let records = received.lock().unwrap();
    // bufferSafe=true: the same underlying buffer travelled through the pool.
    assert_eq!(
        records[0].attachments[0].as_ptr(),
        shared_attachment.as_ptr(),
        "same-pool delivery must not copy attachments"
    );
    assert_eq!(records[0].attachments[0], shared_attachment);
    // bufferSafe=false: a defensive copy was made before dispatch.
    assert_ne!(
        records[1].attachments[0].as_ptr(),
        copied_attachment.as_ptr(),
        "bufferSafe=false must detach from caller-owned memory"
    );
    assert_eq!(records[1].attachments[0], copied_attachment);
    drop(records);

    consumer.disable();
    producer.disable();
}

// =============================================================================
// Connect races
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_yield_exactly_one_success() {
    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let consumer = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Wait),
        Arc::clone(&pool),
    )
    .unwrap();

    let remote = RemoteInfo::tcp(producer.id(), "127.0.0.1", producer.local_addr().port());
    let (first, second) = tokio::join!(consumer.connect(remote.clone()), consumer.connect(remote));

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one logical success");
    let failure = if first.is_ok() { second } else { first };
    assert!(matches!(
        failure,
        Err(ConnectError::AlreadyConnecting) | Err(ConnectError::AlreadyConnected)
    ));

    consumer.disable();
    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_cancels_attempt_and_next_connect_succeeds() {
    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let consumer = Arc::new(
        ConsumerChannel::new(
            consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Wait),
            Arc::clone(&pool),
        )
        .unwrap(),
    );

    // An attempt against a blackholed target stays in flight long enough to
    // race; on kernels that reject fast, the attempt simply fails instead.
    let blackhole = RemoteInfo::tcp("out0", "203.0.113.1", 9);
    let racer = Arc::clone(&consumer);
    let attempt = tokio::spawn(async move { racer.connect(blackhole).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    consumer.disconnect("out0");

    // The rule: the in-flight attempt never ends up connected; its caller
    // always observes the outcome.
    let outcome = tokio::time::timeout(Duration::from_secs(15), attempt)
        .await
        .expect("connect outcome must be delivered")
        .unwrap();
    assert!(outcome.is_err());
    assert_eq!(consumer.status("out0"), ConnectionStatus::Disconnected);

    // A later connect starts a fresh attempt and succeeds.
    let real = RemoteInfo::tcp(producer.id(), "127.0.0.1", producer.local_addr().port());
    consumer.connect(real).await.unwrap();
    assert_eq!(consumer.status(&producer.id()), ConnectionStatus::Connected);

    consumer.disable();
    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disable_delivers_pending_connect_outcome() {
    let pool = test_pool();
    let consumer = Arc::new(
        ConsumerChannel::new(
            consumer_config("in0", DistributionClass::Copy, SlownessPolicy::Wait),
            Arc::clone(&pool),
        )
        .unwrap(),
    );

    let blackhole = RemoteInfo::tcp("out0", "203.0.113.1", 9);
    let racer = Arc::clone(&consumer);
    let attempt = tokio::spawn(async move { racer.connect(blackhole).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    consumer.disable();

    // Teardown must not swallow the pending callback.
    let outcome = tokio::time::timeout(Duration::from_secs(15), attempt)
        .await
        .expect("connect outcome must be delivered despite teardown")
        .unwrap();
    assert!(outcome.is_err());
}

// =============================================================================
// Reconnect picks up queued end-of-stream
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn supersede_preserves_queued_end_of_stream() {
    let pool = test_pool();
    let producer = ProducerChannel::bind(producer_config("out0"), Arc::clone(&pool))
        .await
        .unwrap();

    // The first "in0" acknowledges so slowly that the marker is still queued
    // when its replacement arrives.
    let mut slow = consumer_config("in0", DistributionClass::Copy, SlownessPolicy::QueueDrop);
    slow.delay_on_input = Duration::from_secs(5);
    let first = ConsumerChannel::new(slow, Arc::clone(&pool)).unwrap();
    let first_sink = Arc::new(Sink::default());
    first_sink.attach(&first);
    connect_and_register(&first, &producer).await;

    producer.write(record(0)).unwrap();
    producer.flush(true).await.unwrap();
    producer.signal_end_of_stream().await.unwrap();

    // Re-hello under the same consumer id on a fresh connection: the old
    // registration is superseded, its queued marker carries over.
    let second = ConsumerChannel::new(
        consumer_config("in0", DistributionClass::Copy, SlownessPolicy::QueueDrop),
        Arc::clone(&pool),
    )
    .unwrap();
    let second_sink = Arc::new(Sink::default());
    second_sink.attach(&second);
    second
        .connect(RemoteInfo::tcp(
            producer.id(),
            "127.0.0.1",
            producer.local_addr().port(),
        ))
        .await
        .unwrap();

    wait_until(|| second_sink.eos_count() == 1, Duration::from_secs(30)).await;
    assert_eq!(producer.consumer_count(), 1, "old registration was superseded");

    first.disable();
    second.disable();
    producer.disable();
}
