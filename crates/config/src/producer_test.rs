//! Tests for producer configuration

use std::str::FromStr;
use std::time::Duration;

use weir_protocol::{SlownessPolicy, ValidateMode};

use crate::{ConfigError, ProducerConfig};

#[test]
fn test_defaults() {
    let config = ProducerConfig::default();

    assert_eq!(config.hostname, "0.0.0.0");
    assert_eq!(config.port, 0);
    assert_eq!(config.no_input_shared, SlownessPolicy::Wait);
    assert_eq!(config.update_period, Duration::from_secs(10));
    assert_eq!(config.validate_schema, ValidateMode::Once);
    config.validate().unwrap();
}

#[test]
fn test_parse_minimal() {
    let config = ProducerConfig::from_str("id = \"out0\"").unwrap();
    assert_eq!(config.id, "out0");
    assert_eq!(config.no_input_shared, SlownessPolicy::Wait);
}

#[test]
fn test_parse_full() {
    let config = ProducerConfig::from_str(
        r#"
        id = "detector_out"
        hostname = "127.0.0.0/8"
        port = 39000
        no_input_shared = "queueDrop"
        update_period = "30s"
        validate_schema = "always"
        max_queue_length = 4
        "#,
    )
    .unwrap();

    assert_eq!(config.port, 39000);
    assert_eq!(config.no_input_shared, SlownessPolicy::QueueDrop);
    assert_eq!(config.update_period, Duration::from_secs(30));
    assert_eq!(config.validate_schema, ValidateMode::Always);
    assert_eq!(config.max_queue_length, 4);
}

#[test]
fn test_legacy_slowness_token_accepted() {
    // "queue" is a legacy token; it must normalize, not fail the parse.
    let config = ProducerConfig::from_str("no_input_shared = \"queue\"").unwrap();
    assert_eq!(config.no_input_shared, SlownessPolicy::QueueDrop);
}

#[test]
fn test_unknown_slowness_token_rejected() {
    assert!(ProducerConfig::from_str("no_input_shared = \"block\"").is_err());
}

#[test]
fn test_empty_id_rejected() {
    let err = ProducerConfig::from_str("id = \"\"").unwrap_err();
    assert!(matches!(err, ConfigError::MissingField { field: "id", .. }));
}

#[test]
fn test_bad_cidr_rejected_at_validate() {
    let err = ProducerConfig::from_str("hostname = \"10.0.0.0/40\"").unwrap_err();
    assert!(matches!(err, ConfigError::AddressResolution { .. }));
}

#[test]
fn test_zero_max_queue_length_rejected() {
    let err = ProducerConfig::from_str("max_queue_length = 0").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidValue {
            field: "max_queue_length",
            ..
        }
    ));
}

#[test]
fn test_zero_update_period_rejected() {
    assert!(ProducerConfig::from_str("update_period = \"0s\"").is_err());
}
