use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tcprelay::{iface, DrainExpiry, Endpoint, Network, ProxyConfig, ProxyServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum time to wait for open connections before exiting, like 15s or 1m30s
    #[arg(long, env = "TCPRELAY_GRACE_PERIOD", default_value = "15s", value_parser = tcprelay::parse_duration)]
    grace_period: Duration,

    /// Network family: tcp, tcp4 or tcp6
    #[arg(short, long, env = "TCPRELAY_NETWORK", default_value = "tcp")]
    network: Network,

    /// Host to bind
    #[arg(long, env = "TCPRELAY_HOST", default_value = tcprelay::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "TCPRELAY_PORT", default_value_t = tcprelay::DEFAULT_PORT)]
    port: u16,

    /// Backend host every connection is relayed to
    #[arg(long, env = "TCPRELAY_BACKEND_HOST", default_value = tcprelay::DEFAULT_HOST)]
    backend_host: String,

    /// Backend port
    #[arg(long, env = "TCPRELAY_BACKEND_PORT", default_value_t = tcprelay::DEFAULT_BACKEND_PORT)]
    backend_port: u16,

    /// Bind to the first usable address of this interface instead of --host
    #[arg(short, long, env = "TCPRELAY_INTERFACE")]
    interface: Option<String>,

    /// What to do with connections still open when the grace period ends: close or abandon
    #[arg(long, env = "TCPRELAY_ON_GRACE_EXPIRY", default_value = "close")]
    on_grace_expiry: DrainExpiry,

    /// Emit logs as JSON lines
    #[arg(long, env = "TCPRELAY_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::new(
            Endpoint::new(self.host, self.port),
            Endpoint::new(self.backend_host, self.backend_port),
        )
        .with_network(self.network)
        .with_grace_period(self.grace_period)
        .with_drain_expiry(self.on_grace_expiry);
        config.interface = self.interface;

        if let Some(name) = config.interface.as_deref() {
            info!(interface = name, "discovering interface addresses");
            match iface::discover_host(name) {
                Ok(Some(ip)) => config.bind.host = ip.to_string(),
                Ok(None) => warn!(interface = name, "no usable address on interface"),
                Err(err) => warn!(interface = name, cause = %err, "interface discovery failed"),
            }
        }
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(cause = %err, "failed to install signal handlers, falling back to ctrl-c");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(cause = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let server = ProxyServer::new(args.into_config());
    server
        .run_until(shutdown_signal())
        .await
        .context("failed to start proxy")?;

    info!("proxy stopped");
    Ok(())
}
