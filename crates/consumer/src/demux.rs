//! Batch demultiplexing
//!
//! Before the data handler runs, the delivered batch is indexed by source
//! and by train id so handlers can pull apart interleaved streams without
//! scanning.

use std::collections::HashMap;

use weir_protocol::Record;

/// Per-source and per-train-id indices over one delivered batch
#[derive(Debug, Default)]
pub(crate) struct DemuxIndex {
    by_source: HashMap<String, Vec<usize>>,
    by_train: HashMap<u64, Vec<usize>>,
}

impl DemuxIndex {
    /// Index a batch; record order is preserved within each bucket
    pub fn build(records: &[Record]) -> Self {
        let mut index = Self::default();
        for (i, record) in records.iter().enumerate() {
            index
                .by_source
                .entry(record.meta.source.clone())
                .or_default()
                .push(i);
            index
                .by_train
                .entry(record.meta.train_id)
                .or_default()
                .push(i);
        }
        index
    }

    pub fn source_indices(&self, source: &str) -> Vec<usize> {
        self.by_source.get(source).cloned().unwrap_or_default()
    }

    pub fn train_indices(&self, train_id: u64) -> Vec<usize> {
        self.by_train.get(&train_id).cloned().unwrap_or_default()
    }
}
