//! Transparent TCP relay with bounded graceful shutdown.
//!
//! Every accepted connection is paired with exactly one new connection to a
//! fixed backend and bytes are copied both ways untouched. On shutdown the
//! listener is closed and open connections get a grace period to finish.

mod config;
mod error;
mod forward;
pub mod iface;
mod server;
mod stream;

pub use config::{
    parse_duration, DrainExpiry, Endpoint, Network, ProxyConfig, DEFAULT_BACKEND_PORT,
    DEFAULT_GRACE_PERIOD, DEFAULT_HOST, DEFAULT_PORT,
};
pub use error::Error;
pub use forward::{Forwarder, Transfer};
pub use server::{ProxyServer, ProxyStats, ServerState};
pub use stream::{ByteCounters, InstrumentedStream};
