//! Producer error types

use thiserror::Error;

/// Errors that can occur in a producer channel
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] weir_config::ConfigError),

    /// Failed to bind the listening socket
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pool bookkeeping error
    #[error("pool error: {0}")]
    Pool(#[from] weir_pool::PoolError),

    /// Chunk pool exhausted and eviction could not make progress
    ///
    /// Retryable: in-flight sends will release chunks.
    #[error("chunk pool exhausted, nothing evictable")]
    PoolExhausted,

    /// Record rejected by the schema validator
    #[error("record rejected by schema: {0}")]
    SchemaRejected(String),

    /// Channel has been disabled
    #[error("producer channel is disabled")]
    Disabled,
}

impl ProducerError {
    /// Whether the operation may succeed if simply retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }
}
