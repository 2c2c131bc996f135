//! JSON statistics formatting

use crate::collected::CollectedStats;
use crate::format::StatsFormatter;

/// One JSON document per snapshot, for log shippers
#[derive(Debug, Default)]
pub struct JsonFormatter;

impl JsonFormatter {
    /// Create a new formatter
    pub fn new() -> Self {
        Self
    }
}

impl StatsFormatter for JsonFormatter {
    fn format(&self, stats: &CollectedStats) -> String {
        serde_json::to_string(stats).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize statistics snapshot");
            String::from("{}")
        })
    }
}
