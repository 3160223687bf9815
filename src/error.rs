use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Faults that reach the caller of [`ProxyServer::start`] or
/// [`ProxyServer::shutdown`]. Per-connection faults never surface here.
///
/// [`ProxyServer::start`]: crate::ProxyServer::start
/// [`ProxyServer::shutdown`]: crate::ProxyServer::shutdown
#[derive(Debug, Error)]
pub enum Error {
    #[error("no host specified")]
    NoHost,

    #[error("unsupported network {0:?}, expected one of tcp, tcp4, tcp6")]
    UnsupportedNetwork(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("invalid drain expiry policy {0:?}, expected close or abandon")]
    InvalidDrainExpiry(String),

    #[error("failed to resolve {endpoint}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to close listener")]
    CloseListener(#[source] io::Error),
}
