//! Consumer channel configuration

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use weir_protocol::{DistributionClass, MemoryLocation, SlownessPolicy};

use crate::{ConfigError, Result};

/// Default queue bound declared in the hello handshake
const DEFAULT_MAX_QUEUE_LENGTH: usize = 8;

/// A remote producer channel this consumer is configured to connect to
///
/// Accepts either the compact string form `"<id>@<host>:<port>"` or a full
/// table with an explicit memory location:
///
/// ```toml
/// connected_remotes = ["detector_out@10.0.0.5:39000"]
///
/// [[connected_remotes]]
/// id = "local_out"
/// hostname = "127.0.0.1"
/// port = 39001
/// memory_location = "local"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RemoteEndpointRepr")]
pub struct RemoteEndpoint {
    /// Remote producer channel id
    pub id: String,

    /// Remote host
    pub hostname: String,

    /// Remote port
    pub port: u16,

    /// Whether this remote shares the consumer's memory pool
    pub memory_location: MemoryLocation,
}

impl RemoteEndpoint {
    /// Host:port pair for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.hostname, self.port)
    }
}

impl FromStr for RemoteEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| {
            ConfigError::invalid_value("consumer", s, "connected_remotes", message)
        };
        let (id, address) = s
            .split_once('@')
            .ok_or_else(|| invalid("expected <remoteId>@<host>:<port>"))?;
        let (hostname, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected <remoteId>@<host>:<port>"))?;
        if id.is_empty() || hostname.is_empty() {
            return Err(invalid("remote id and host must be non-empty"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| invalid(&format!("'{port}' is not a valid port")))?;
        Ok(Self {
            id: id.into(),
            hostname: hostname.into(),
            port,
            memory_location: MemoryLocation::Remote,
        })
    }
}

/// Serde-side representation: compact string or full table
#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteEndpointRepr {
    Compact(String),
    Full {
        id: String,
        hostname: String,
        port: u16,
        #[serde(default = "default_memory_location")]
        memory_location: MemoryLocation,
    },
}

fn default_memory_location() -> MemoryLocation {
    MemoryLocation::Remote
}

impl TryFrom<RemoteEndpointRepr> for RemoteEndpoint {
    type Error = ConfigError;

    fn try_from(repr: RemoteEndpointRepr) -> Result<Self> {
        match repr {
            RemoteEndpointRepr::Compact(s) => s.parse(),
            RemoteEndpointRepr::Full {
                id,
                hostname,
                port,
                memory_location,
            } => Ok(Self {
                id,
                hostname,
                port,
                memory_location,
            }),
        }
    }
}

/// Consumer channel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer channel instance id
    pub id: String,

    /// Remote producer channels this consumer connects to; persists across
    /// reconnects and changes only through explicit reconfiguration
    pub connected_remotes: Vec<RemoteEndpoint>,

    /// Copy (receive everything) or shared (one of a pool)
    /// Default: copy
    pub data_distribution: DistributionClass,

    /// Policy the producer applies when this consumer is slow
    /// Default: wait
    pub on_slowness: SlownessPolicy,

    /// Number of records to accumulate before the data handler runs
    /// (0 or 1 = deliver each chunk as it arrives)
    /// Default: 1
    pub min_data: usize,

    /// Queue bound declared to the producer for the queueDrop policy
    /// Default: 8
    pub max_queue_length: usize,

    /// Whether end-of-stream markers are forwarded to the handler
    /// Default: true
    pub respond_to_end_of_stream: bool,

    /// Delay before notifying the producer of readiness
    /// Default: none
    #[serde(with = "humantime_serde")]
    pub delay_on_input: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            id: "consumer".into(),
            connected_remotes: Vec::new(),
            data_distribution: DistributionClass::Copy,
            on_slowness: SlownessPolicy::Wait,
            min_data: 1,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            respond_to_end_of_stream: true,
            delay_on_input: Duration::ZERO,
        }
    }
}

impl ConsumerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ConfigError::missing_field("consumer", &self.id, "id"));
        }
        if self.max_queue_length == 0 {
            return Err(ConfigError::invalid_value(
                "consumer",
                &self.id,
                "max_queue_length",
                "must be at least 1",
            ));
        }

        let mut seen = HashSet::new();
        for remote in &self.connected_remotes {
            if remote.port == 0 {
                return Err(ConfigError::invalid_value(
                    "consumer",
                    &self.id,
                    "connected_remotes",
                    format!("remote '{}' has port 0", remote.id),
                ));
            }
            if !seen.insert(remote.id.as_str()) {
                return Err(ConfigError::DuplicateRemote {
                    id: remote.id.clone(),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for ConsumerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
