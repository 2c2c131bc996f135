//! Tests for batch demultiplexing

use bytes::Bytes;
use weir_protocol::{Record, RecordMeta};

use crate::demux::DemuxIndex;

fn record(source: &str, train_id: u64) -> Record {
    Record::new(RecordMeta::new(source, train_id), Bytes::from_static(b"x"))
}

#[test]
fn test_build_indexes_by_source_and_train() {
    let records = vec![
        record("cam0", 1),
        record("cam1", 1),
        record("cam0", 2),
        record("cam1", 2),
        record("cam0", 2),
    ];

    let index = DemuxIndex::build(&records);

    assert_eq!(index.source_indices("cam0"), vec![0, 2, 4]);
    assert_eq!(index.source_indices("cam1"), vec![1, 3]);
    assert_eq!(index.train_indices(1), vec![0, 1]);
    assert_eq!(index.train_indices(2), vec![2, 3, 4]);
}

#[test]
fn test_unknown_keys_are_empty() {
    let index = DemuxIndex::build(&[record("cam0", 1)]);

    assert!(index.source_indices("cam9").is_empty());
    assert!(index.train_indices(42).is_empty());
}

#[test]
fn test_empty_batch() {
    let index = DemuxIndex::build(&[]);
    assert!(index.source_indices("cam0").is_empty());
}

#[test]
fn test_order_preserved_within_bucket() {
    let records = vec![
        record("s", 9),
        record("s", 9),
        record("s", 9),
    ];

    let index = DemuxIndex::build(&records);
    assert_eq!(index.train_indices(9), vec![0, 1, 2]);
}
