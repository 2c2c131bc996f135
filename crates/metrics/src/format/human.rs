//! Human-readable statistics formatting

use std::fmt::Write;

use crate::collected::CollectedStats;
use crate::format::StatsFormatter;

/// One line per connection, aligned for eyeballs not parsers
#[derive(Debug, Default)]
pub struct HumanFormatter;

impl HumanFormatter {
    /// Create a new formatter
    pub fn new() -> Self {
        Self
    }
}

impl StatsFormatter for HumanFormatter {
    fn format(&self, stats: &CollectedStats) -> String {
        if stats.connection_count() == 0 {
            return "connections: none".into();
        }

        let mut out = String::new();
        for channel in &stats.channels {
            for row in &channel.connections {
                let _ = writeln!(
                    out,
                    "{} {} <-> {} [{} {} {} {}] read={} written={} sent={} queued={} dropped={}",
                    channel.role,
                    channel.id,
                    row.remote_id,
                    row.distribution,
                    row.slowness,
                    row.memory_location,
                    row.remote_addr,
                    row.snapshot.bytes_read,
                    row.snapshot.bytes_written,
                    row.snapshot.chunks_sent,
                    row.snapshot.chunks_queued,
                    row.snapshot.chunks_dropped,
                );
            }
        }
        out.truncate(out.trim_end().len());
        out
    }
}
