//! Periodic statistics reporter
//!
//! Collects connection tables from registered providers at the configured
//! interval and emits them via tracing. Runs as a task on the shared
//! execution context and stops on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collected::{CollectedChannel, CollectedStats};
use crate::format::{HumanFormatter, JsonFormatter, StatsFormatter};
use crate::traits::ChannelStatsProvider;

/// Output format for the reporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsFormat {
    /// Aligned text, one line per connection
    #[default]
    Human,
    /// One JSON document per snapshot
    Json,
}

/// Reporter configuration
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Whether the reporter runs at all
    pub enabled: bool,
    /// Collection interval
    pub interval: Duration,
    /// Output format
    pub format: StatsFormat,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            format: StatsFormat::Human,
        }
    }
}

/// Builder for constructing a StatsReporter
#[derive(Default)]
pub struct StatsReporterBuilder {
    config: Option<ReporterConfig>,
    providers: Vec<Arc<dyn ChannelStatsProvider>>,
}

impl StatsReporterBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reporter configuration
    pub fn config(mut self, config: ReporterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a channel stats provider
    pub fn provider(mut self, provider: Arc<dyn ChannelStatsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Register multiple channel stats providers
    pub fn providers(mut self, providers: Vec<Arc<dyn ChannelStatsProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// Build the StatsReporter
    pub fn build(self) -> StatsReporter {
        let config = self.config.unwrap_or_default();
        let formatter: Box<dyn StatsFormatter> = match config.format {
            StatsFormat::Human => Box::new(HumanFormatter::new()),
            StatsFormat::Json => Box::new(JsonFormatter::new()),
        };
        StatsReporter {
            config,
            formatter,
            providers: self.providers,
        }
    }
}

/// Periodic statistics reporter
pub struct StatsReporter {
    config: ReporterConfig,
    formatter: Box<dyn StatsFormatter>,
    providers: Vec<Arc<dyn ChannelStatsProvider>>,
}

impl StatsReporter {
    /// Create a new builder
    pub fn builder() -> StatsReporterBuilder {
        StatsReporterBuilder::new()
    }

    /// Run the reporter until cancellation
    ///
    /// Spawn this as a task on the shared execution context.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("statistics reporting disabled");
            return;
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            providers = self.providers.len(),
            "statistics reporter started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("statistics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }

    /// Collect and report statistics once
    fn report(&self) {
        let stats = self.collect();
        let output = self.formatter.format(&stats);
        for line in output.lines() {
            info!("{}", line);
        }
    }

    /// Collect connection tables from all registered providers
    fn collect(&self) -> CollectedStats {
        CollectedStats {
            channels: self
                .providers
                .iter()
                .map(|p| CollectedChannel {
                    id: p.channel_id().to_string(),
                    role: p.role().to_string(),
                    connections: p.connections(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ConnectionRow;

    struct TestProvider;

    impl ChannelStatsProvider for TestProvider {
        fn channel_id(&self) -> &str {
            "out0"
        }
        fn role(&self) -> &str {
            "producer"
        }
        fn connections(&self) -> Vec<ConnectionRow> {
            Vec::new()
        }
    }

    #[test]
    fn test_builder_default() {
        let reporter = StatsReporter::builder().build();
        assert!(reporter.config.enabled);
        assert_eq!(reporter.config.interval, Duration::from_secs(10));
        assert!(reporter.providers.is_empty());
    }

    #[test]
    fn test_collect_with_provider() {
        let reporter = StatsReporter::builder()
            .provider(Arc::new(TestProvider))
            .build();

        let stats = reporter.collect();
        assert_eq!(stats.channels.len(), 1);
        assert_eq!(stats.channels[0].id, "out0");
    }

    #[tokio::test]
    async fn test_run_disabled_returns_immediately() {
        let reporter = StatsReporter::builder()
            .config(ReporterConfig {
                enabled: false,
                ..Default::default()
            })
            .build();

        reporter.run(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let reporter = StatsReporter::builder()
            .config(ReporterConfig {
                interval: Duration::from_millis(20),
                ..Default::default()
            })
            .build();

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        reporter.run(cancel).await;
    }
}
