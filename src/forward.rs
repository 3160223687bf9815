use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, Network};
use crate::server::ProxyStats;
use crate::stream::InstrumentedStream;

/// Bytes moved by one finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    /// The connection was cut short by the drain deadline.
    pub forced: bool,
}

/// Turns one accepted connection into a relayed session with the backend.
#[derive(Debug, Clone)]
pub struct Forwarder {
    network: Network,
    backend: Endpoint,
    stats: Arc<ProxyStats>,
}

impl Forwarder {
    pub fn new(network: Network, backend: Endpoint, stats: Arc<ProxyStats>) -> Self {
        Self {
            network,
            backend,
            stats,
        }
    }

    /// Dials the backend and copies both directions until each side is done.
    ///
    /// Only a dial failure is returned as an error. Copy errors end their own
    /// direction and are logged; cancelling `abort` drops both streams.
    pub async fn run(
        &self,
        conn_id: u64,
        inbound: TcpStream,
        abort: CancellationToken,
    ) -> Result<Transfer> {
        let outbound = tokio::select! {
            res = dial(self.network, &self.backend) => res.inspect_err(|_| {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            })?,
            _ = abort.cancelled() => return Ok(Transfer { forced: true, ..Default::default() }),
        };

        if let Err(err) = inbound.set_nodelay(true).and(outbound.set_nodelay(true)) {
            debug!(cause = %err, "failed to set TCP_NODELAY");
        }

        let client = InstrumentedStream::new(inbound, "client").with_conn_id(conn_id);
        let backend = InstrumentedStream::new(outbound, "backend").with_conn_id(conn_id);
        // Totals count what was written to each peer, not what was read.
        let to_client = client.counters();
        let to_backend = backend.counters();
        let (mut ri, mut wi) = tokio::io::split(client);
        let (mut ro, mut wo) = tokio::io::split(backend);

        let client_to_server = async {
            let res = tokio::io::copy(&mut ri, &mut wo).await;
            finish_direction("client->backend", to_backend.written(), res, wo.shutdown().await);
        };

        let server_to_client = async {
            let res = tokio::io::copy(&mut ro, &mut wi).await;
            finish_direction("backend->client", to_client.written(), res, wi.shutdown().await);
        };

        let forced = tokio::select! {
            _ = async { tokio::join!(client_to_server, server_to_client) } => false,
            _ = abort.cancelled() => {
                warn!("grace period elapsed, closing connection");
                true
            }
        };

        let transfer = Transfer {
            client_to_backend: to_backend.written(),
            backend_to_client: to_client.written(),
            forced,
        };
        self.stats
            .bytes_to_backend
            .fetch_add(transfer.client_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(transfer.backend_to_client, Ordering::Relaxed);

        Ok(transfer)
    }
}

fn finish_direction(
    direction: &'static str,
    bytes: u64,
    copied: io::Result<u64>,
    shutdown: io::Result<()>,
) {
    match copied {
        Ok(_) => info!(direction, bytes, "copy finished"),
        Err(err) => warn!(direction, bytes, cause = %err, "copy failed"),
    }
    if let Err(err) = shutdown {
        debug!(direction, cause = %err, "failed to shut down write half");
    }
}

/// Connects to the first reachable address of `backend` within `network`.
async fn dial(network: Network, backend: &Endpoint) -> Result<TcpStream> {
    let addrs = backend
        .resolve(network)
        .await
        .with_context(|| format!("failed to resolve backend {backend}"))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, cause = %err, "backend address unreachable");
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
    Err(err).with_context(|| format!("failed to connect to backend {backend}"))
}
