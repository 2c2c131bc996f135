//! Consumer error types

use thiserror::Error;

/// Failures of an asynchronous connect attempt
///
/// Surfaced through the connect result, never thrown across an async
/// boundary.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Only tcp transports are supported
    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),

    /// Port 0 cannot be dialed
    #[error("invalid remote port")]
    BadPort,

    /// The remote info is missing a required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The remote id is not in the output registration table
    #[error("unknown remote channel '{0}'")]
    UnknownRemote(String),

    /// TCP connect failed
    #[error("cannot reach {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect timed out
    #[error("connect to {target} timed out")]
    Timeout { target: String },

    /// A connection to this remote already exists
    #[error("already connected")]
    AlreadyConnected,

    /// Another connect to this remote is in flight
    #[error("already connecting")]
    AlreadyConnecting,

    /// The attempt was canceled by a disconnect or channel teardown
    #[error("operation canceled")]
    Canceled,
}

/// Errors that can occur in a consumer channel
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] weir_config::ConfigError),

    /// Pool bookkeeping error
    #[error("pool error: {0}")]
    Pool(#[from] weir_pool::PoolError),

    /// Handlers cannot be (re)registered while a connection is active
    #[error("handlers must be registered while disconnected")]
    HandlersLocked,

    /// Reconfiguration is rejected while a connection is active
    #[error("cannot reconfigure while connections are active")]
    ReconfigureWhileActive,

    /// Channel has been disabled
    #[error("consumer channel is disabled")]
    Disabled,
}
