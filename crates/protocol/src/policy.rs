//! Consumer policy tokens
//!
//! The tokens a consumer declares in its hello handshake: how data is
//! distributed to it, what the producer does when it is slow, and whether it
//! shares a memory pool with the producer. Parsing accepts the legacy
//! `"queue"` / `"throw"` slowness tokens and normalizes them with a warning.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

/// How records are distributed to a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionClass {
    /// Consumer receives every record
    Copy,
    /// Consumer is one of a pool; each record goes to exactly one member
    Shared,
}

impl DistributionClass {
    /// String token for the wire and for configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Shared => "shared",
        }
    }
}

impl FromStr for DistributionClass {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Self::Copy),
            "shared" => Ok(Self::Shared),
            other => Err(ProtocolError::unknown_token("dataDistribution", other)),
        }
    }
}

impl fmt::Display for DistributionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the producer does when a consumer cannot currently accept data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlownessPolicy {
    /// Block the flush until the consumer reports readiness
    Wait,
    /// Discard the chunk (end-of-stream markers are never dropped)
    Drop,
    /// Queue up to the max queue length, then drop the oldest entry
    QueueDrop,
}

impl SlownessPolicy {
    /// String token for the wire and for configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Drop => "drop",
            Self::QueueDrop => "queueDrop",
        }
    }
}

impl FromStr for SlownessPolicy {
    type Err = ProtocolError;

    /// Parse a slowness token, normalizing legacy spellings
    ///
    /// `"queue"` and `"throw"` come from older peers and map to `queueDrop`
    /// and `drop` respectively; they are accepted with a warning so old
    /// consumers keep working against new producers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "drop" => Ok(Self::Drop),
            "queueDrop" => Ok(Self::QueueDrop),
            "queue" => {
                tracing::warn!(token = s, "legacy slowness token, treating as queueDrop");
                Ok(Self::QueueDrop)
            }
            "throw" => {
                tracing::warn!(token = s, "legacy slowness token, treating as drop");
                Ok(Self::Drop)
            }
            other => Err(ProtocolError::unknown_token("onSlowness", other)),
        }
    }
}

impl fmt::Display for SlownessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a consumer shares the producer's memory pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Same host and process group: chunks are handed over by pool reference
    Local,
    /// Different host or process: chunks are serialized onto the wire
    Remote,
}

impl MemoryLocation {
    /// String token for the wire and for configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for MemoryLocation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(ProtocolError::unknown_token("memoryLocation", other)),
        }
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Serde goes through the string tokens so wire headers stay readable and
// legacy normalization applies on receipt.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let token = String::deserialize(deserializer)?;
                token.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(DistributionClass);
string_serde!(SlownessPolicy);
string_serde!(MemoryLocation);
