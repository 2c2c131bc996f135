//! Weir Configuration
//!
//! TOML-based configuration for producer and consumer channels with sensible
//! defaults - a minimal config should just work. Validation is synchronous:
//! invalid ports, unknown policy tokens, and conflicting fields surface here,
//! at construction time, never from inside a running channel.
//!
//! # Example Producer Config
//!
//! ```toml
//! id = "detector_out"
//! hostname = "10.0.0.0/24"
//! port = 0
//! no_input_shared = "wait"
//! validate_schema = "once"
//! ```
//!
//! # Example Consumer Config
//!
//! ```toml
//! id = "analysis_in"
//! data_distribution = "shared"
//! on_slowness = "queueDrop"
//! max_queue_length = 4
//! connected_remotes = ["detector_out@10.0.0.5:39000"]
//! ```

mod address;
mod consumer;
mod error;
mod producer;

pub use address::resolve_bind_address;
pub use consumer::{ConsumerConfig, RemoteEndpoint};
pub use error::{ConfigError, Result};
pub use producer::ProducerConfig;

#[cfg(test)]
mod producer_test;
