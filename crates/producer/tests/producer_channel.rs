//! Producer channel behavior against real sockets
//!
//! Construction, schema validation modes, empty-flush short-circuit, and
//! idempotent teardown. Dispatch policy details live in the crate's unit
//! tests; full pipelines are exercised in the consumer crate's e2e suite.

use std::sync::Arc;

use bytes::Bytes;
use weir_config::ProducerConfig;
use weir_pool::ChunkPool;
use weir_producer::{ProducerChannel, ProducerError};
use weir_protocol::{Record, RecordMeta, RecordSchema, ValidateMode};

fn config(id: &str) -> ProducerConfig {
    ProducerConfig {
        id: id.into(),
        hostname: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

fn record(payload: &'static [u8]) -> Record {
    Record::new(RecordMeta::new("src", 1), Bytes::from_static(payload))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bind_ephemeral_port_exposes_bound_address() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), pool).await.unwrap();

    assert_ne!(producer.local_addr().port(), 0);
    assert!(producer.local_addr().ip().is_loopback());
    assert_eq!(producer.consumer_count(), 0);

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validator_always_rejects_every_bad_record() {
    let pool = ChunkPool::new(4, 16);
    let mut cfg = config("out0");
    cfg.validate_schema = ValidateMode::Always;
    let producer = ProducerChannel::bind(cfg, pool).await.unwrap();
    producer.set_validator(Arc::new(RecordSchema {
        min_payload: 4,
        ..Default::default()
    }));

    producer.write(record(b"long enough")).unwrap();
    let err = producer.write(record(b"x")).unwrap_err();
    assert!(matches!(err, ProducerError::SchemaRejected(_)));
    // Always mode keeps checking.
    assert!(producer.write(record(b"no")).is_err());
    assert!(producer.write(record(b"fine")).is_ok());

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validator_once_checks_only_the_first_record_of_a_stream() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), pool).await.unwrap();
    producer.set_validator(Arc::new(RecordSchema {
        min_payload: 4,
        ..Default::default()
    }));

    // First record fails: nothing is admitted, the stream stays unvalidated.
    assert!(producer.write(record(b"x")).is_err());
    // A valid first record passes and arms the epoch.
    producer.write(record(b"valid one")).unwrap();
    // Subsequent records of the epoch are not re-checked in once mode.
    producer.write(record(b"x")).unwrap();

    // A new stream epoch revalidates its first record.
    producer.signal_end_of_stream().await.unwrap();
    assert!(producer.write(record(b"x")).is_err());

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_without_data_keeps_the_active_chunk() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let channel = producer.pool_channel();
    assert_eq!(pool.live_chunks(channel), 1);

    producer.flush(true).await.unwrap();
    producer.flush(true).await.unwrap();

    // No rotation happened; no chunks were churned.
    assert_eq!(pool.live_chunks(channel), 1);

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_with_no_consumers_releases_the_chunk() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let channel = producer.pool_channel();

    producer.write(record(b"data")).unwrap();
    producer.flush(true).await.unwrap();

    // Nobody was registered: the dispatched chunk is gone, one active remains.
    assert_eq!(pool.live_chunks(channel), 1);

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn synchronous_flush_wrapper_completes() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), pool).await.unwrap();

    producer.write(record(b"data")).unwrap();
    producer.flush_sync(true).unwrap();
    producer.signal_end_of_stream_sync().unwrap();

    producer.disable();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disable_is_idempotent_and_rejects_further_writes() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), Arc::clone(&pool))
        .await
        .unwrap();
    let channel = producer.pool_channel();

    producer.disable();
    producer.disable();

    assert_eq!(pool.live_chunks(channel), 0);
    assert!(matches!(
        producer.write(record(b"late")).unwrap_err(),
        ProducerError::Disabled
    ));
    assert!(matches!(
        producer.flush(true).await.unwrap_err(),
        ProducerError::Disabled
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn selector_registration_is_accepted() {
    let pool = ChunkPool::new(4, 16);
    let producer = ProducerChannel::bind(config("out0"), pool).await.unwrap();

    producer.register_consumer_selector(Box::new(|ids: &[String]| ids.first().cloned()));

    producer.disable();
}
