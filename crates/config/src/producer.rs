//! Producer channel configuration

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use weir_protocol::{SlownessPolicy, ValidateMode};

use crate::address::validate_address_spec;
use crate::{ConfigError, Result};

/// Default statistics emission period
const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on per-consumer and shared pending queues
const DEFAULT_MAX_QUEUE_LENGTH: usize = 8;

/// Producer channel configuration
///
/// # Example
///
/// ```toml
/// id = "detector_out"
/// hostname = "0.0.0.0"
/// port = 39000
/// no_input_shared = "wait"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Producer channel instance id
    pub id: String,

    /// Bind address: a literal IP, a resolvable host name, or a CIDR range
    /// Default: "0.0.0.0"
    pub hostname: String,

    /// Listen port (0 = ephemeral, bound address exposed after construction)
    pub port: u16,

    /// Policy when no shared consumer is available for a dispatch
    /// Default: wait
    pub no_input_shared: SlownessPolicy,

    /// Statistics snapshot emission period
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub update_period: Duration,

    /// When schema validation runs: once per stream or for every record
    /// Default: once
    pub validate_schema: ValidateMode,

    /// Bound on the shared pending queue and the default for consumers that
    /// declare no queue bound of their own
    /// Default: 8
    pub max_queue_length: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            id: "producer".into(),
            hostname: "0.0.0.0".into(),
            port: 0,
            no_input_shared: SlownessPolicy::Wait,
            update_period: DEFAULT_UPDATE_PERIOD,
            validate_schema: ValidateMode::Once,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

impl ProducerConfig {
    /// Validate the configuration
    ///
    /// Surfaces configuration errors synchronously, before any socket is
    /// opened.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ConfigError::missing_field("producer", &self.id, "id"));
        }
        if self.hostname.is_empty() {
            return Err(ConfigError::missing_field("producer", &self.id, "hostname"));
        }
        validate_address_spec(&self.hostname)?;
        if self.max_queue_length == 0 {
            return Err(ConfigError::invalid_value(
                "producer",
                &self.id,
                "max_queue_length",
                "must be at least 1",
            ));
        }
        if self.update_period.is_zero() {
            return Err(ConfigError::invalid_value(
                "producer",
                &self.id,
                "update_period",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

impl FromStr for ProducerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
