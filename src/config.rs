use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net;

use crate::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6101;
pub const DEFAULT_BACKEND_PORT: u16 = 4500;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Address family used for both the listener and backend dials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    /// Either family, whichever resolves first.
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            _ => Err(Error::UnsupportedNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

/// What happens to connections still forwarding when the grace period runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainExpiry {
    /// Cancel the remaining forwarders, dropping both of their streams.
    #[default]
    ForceClose,
    /// Leave the remaining forwarders running; process exit ends them.
    Abandon,
}

impl FromStr for DrainExpiry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "close" | "force-close" => Ok(DrainExpiry::ForceClose),
            "abandon" => Ok(DrainExpiry::Abandon),
            _ => Err(Error::InvalidDrainExpiry(s.to_string())),
        }
    }
}

/// A host and port pair. The host may be a name or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the endpoint, keeping only addresses of the given family.
    pub async fn resolve(&self, network: Network) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<_> = net::lookup_host((self.host.as_str(), self.port))
            .await?
            .filter(|addr| network.matches(addr))
            .collect();

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address for {self}"),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Everything the relay needs, resolved once before the server is built.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub network: Network,
    pub bind: Endpoint,
    pub backend: Endpoint,
    /// Upper bound on how long `start` waits for open connections after shutdown.
    pub grace_period: Duration,
    /// Interface whose address was (or should be) used as the bind host.
    pub interface: Option<String>,
    pub drain_expiry: DrainExpiry,
}

impl ProxyConfig {
    pub fn new(bind: Endpoint, backend: Endpoint) -> Self {
        Self {
            network: Network::default(),
            bind,
            backend,
            grace_period: DEFAULT_GRACE_PERIOD,
            interface: None,
            drain_expiry: DrainExpiry::default(),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_drain_expiry(mut self, drain_expiry: DrainExpiry) -> Self {
        self.drain_expiry = drain_expiry;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.bind.host.trim().is_empty() {
            return Err(Error::NoHost);
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(
            Endpoint::new(DEFAULT_HOST, DEFAULT_PORT),
            Endpoint::new(DEFAULT_HOST, DEFAULT_BACKEND_PORT),
        )
    }
}

/// Parses durations like `15s`, `250ms` or `1m30s`. A bare integer is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || Error::InvalidDuration(input.to_string());

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humanize_rs::duration::parse(s).map_err(|_| invalid())
}
