//! Weir Metrics - per-connection statistics and the periodic reporter
//!
//! Producer and consumer channels expose their connection tables through the
//! [`ChannelStatsProvider`] trait; the [`StatsReporter`] collects snapshots
//! at a configured interval and emits them via tracing, in human or JSON
//! form. The snapshots are observability data only - nothing in the pipeline
//! makes control decisions from them.
//!
//! # Design
//!
//! - Metric structs use atomics internally, so no locks are needed on the
//!   hot path and `&self` suffices for updates
//! - Providers are trait objects; the reporter never knows concrete channel
//!   types

mod collected;
mod format;
mod reporter;
mod traits;

pub use collected::{CollectedChannel, CollectedStats};
pub use format::{HumanFormatter, JsonFormatter, StatsFormatter};
pub use reporter::{ReporterConfig, StatsFormat, StatsReporter, StatsReporterBuilder};
pub use traits::{ChannelStatsProvider, ConnectionMetrics, ConnectionMetricsSnapshot, ConnectionRow};
