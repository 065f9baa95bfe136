//! Error types for the proxy core.

use std::time::Duration;

use crate::hooks::HookError;
use crate::upstream::UpstreamError;

/// Errors raised while constructing, running, or connecting through the proxy.
///
/// None of these reach a client as an error packet: they end the connection
/// (or the listener) and are logged. Per-query failures are carried by
/// [`crate::response::ErrorResponse`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot reach upstream server: {0}")]
    UpstreamConnect(#[source] UpstreamError),

    #[error("upstream connect timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("hook failed: {0}")]
    Hook(#[from] HookError),

    #[error("proxy is shutting down")]
    ShuttingDown,

    #[error("proxy is already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
