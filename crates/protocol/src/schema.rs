//! Schema validation boundary
//!
//! The schema/validation engine is an external collaborator; producer
//! channels consume it through this narrow contract only: validate a record,
//! get ok or an error message. `RecordSchema` is a small structural checker
//! used as the default implementation and in tests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::record::Record;
use crate::ProtocolError;

/// When the producer runs schema validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidateMode {
    /// Validate the first record of each stream only
    #[default]
    Once,
    /// Validate every record
    Always,
}

impl ValidateMode {
    /// String token for configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
        }
    }
}

impl FromStr for ValidateMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "always" => Ok(Self::Always),
            other => Err(ProtocolError::unknown_token("validateSchema", other)),
        }
    }
}

impl fmt::Display for ValidateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ValidateMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ValidateMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        token.parse().map_err(serde::de::Error::custom)
    }
}

/// The contract to the schema/validation engine
///
/// A failed validation is reported as a message; the producer turns it into
/// a parameter error and does not enqueue the record.
pub trait SchemaValidator: Send + Sync {
    /// Validate a record; `Err` carries the rejection message
    fn validate(&self, record: &Record) -> Result<(), String>;
}

/// Structural record schema
///
/// Checks the shape of a record without interpreting the payload encoding.
#[derive(Debug, Clone, Default)]
pub struct RecordSchema {
    /// Reject records with an empty source identifier
    pub require_source: bool,

    /// Minimum structured payload size in bytes
    pub min_payload: usize,

    /// Upper bound on attachment count, if any
    pub max_attachments: Option<usize>,
}

impl SchemaValidator for RecordSchema {
    fn validate(&self, record: &Record) -> Result<(), String> {
        if self.require_source && record.meta.source.is_empty() {
            return Err("record has empty source identifier".into());
        }
        if record.payload.len() < self.min_payload {
            return Err(format!(
                "payload {} bytes, schema requires at least {}",
                record.payload.len(),
                self.min_payload
            ));
        }
        if let Some(max) = self.max_attachments {
            if record.attachments.len() > max {
                return Err(format!(
                    "{} attachments, schema allows at most {}",
                    record.attachments.len(),
                    max
                ));
            }
        }
        Ok(())
    }
}
