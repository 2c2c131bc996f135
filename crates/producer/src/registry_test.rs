//! Tests for registry bookkeeping

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weir_metrics::ConnectionMetrics;
use weir_protocol::{DistributionClass, MemoryLocation, SlownessPolicy};

use crate::registry::{ConsumerEntry, Registry};

fn entry(id: &str, class: DistributionClass, generation: u64) -> ConsumerEntry {
    let (writer, _rx) = mpsc::channel(4);
    // The receiver drops immediately; these tests never send.
    ConsumerEntry {
        id: id.into(),
        class,
        policy: SlownessPolicy::Wait,
        memory_location: MemoryLocation::Remote,
        max_queue_length: 2,
        ready: false,
        queue: VecDeque::new(),
        blocked: VecDeque::new(),
        held_local: Vec::new(),
        writer,
        generation,
        conn_cancel: CancellationToken::new(),
        peer: "127.0.0.1:1000".parse().unwrap(),
        local_addr: "127.0.0.1:2000".parse().unwrap(),
        metrics: Arc::new(ConnectionMetrics::new()),
    }
}

#[test]
fn test_shared_ids_filters_by_class() {
    let mut registry = Registry::default();
    registry
        .consumers
        .insert("c0".into(), entry("c0", DistributionClass::Copy, 0));
    registry
        .consumers
        .insert("s0".into(), entry("s0", DistributionClass::Shared, 1));

    assert_eq!(registry.shared_ids(), vec!["s0".to_string()]);
    assert!(registry.has_shared());
}

#[test]
fn test_remove_if_generation_matches() {
    let mut registry = Registry::default();
    registry
        .consumers
        .insert("s0".into(), entry("s0", DistributionClass::Shared, 3));
    registry.share_next.push_back("s0".into());

    let removed = registry.remove_if_generation("s0", 3);
    assert!(removed.is_some());
    assert!(registry.share_next.is_empty());
}

#[test]
fn test_remove_if_generation_ignores_stale_disconnect() {
    // A superseded connection's cleanup must not tear down the registration
    // its replacement installed under the same consumer id.
    let mut registry = Registry::default();
    registry
        .consumers
        .insert("s0".into(), entry("s0", DistributionClass::Shared, 7));

    assert!(registry.remove_if_generation("s0", 3).is_none());
    assert!(registry.consumers.contains_key("s0"));
}

#[test]
fn test_release_cancels_connection() {
    let e = entry("c0", DistributionClass::Copy, 0);
    let cancel = e.conn_cancel.clone();

    e.release();
    assert!(cancel.is_cancelled());
}

#[test]
fn test_stats_rows_reflect_registrations() {
    let mut registry = Registry::default();
    registry
        .consumers
        .insert("c0".into(), entry("c0", DistributionClass::Copy, 0));

    let rows = registry.stats_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].remote_id, "c0");
    assert_eq!(rows[0].distribution, "copy");
    assert_eq!(rows[0].slowness, "wait");
}
