use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{DrainExpiry, ProxyConfig};
use crate::forward::Forwarder;
use crate::Error;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Counters shared by the accept loop and every connection task.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Connections returned by the listener.
    pub accepted: AtomicU64,
    /// Connections whose forwarder task has started.
    pub dispatched: AtomicU64,
    /// Forwarders currently running.
    pub active: AtomicU64,
    /// Forwarders that have finished, successfully or not.
    pub closed: AtomicU64,
    pub dial_failures: AtomicU64,
    pub accept_failures: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening(SocketAddr),
    Draining,
    Stopped,
}

impl ServerState {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerState::Listening(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// The relay: one listener, one backend, one shutdown signal.
///
/// `start` and `shutdown` both take `&self`, so the server is usually
/// shared through an `Arc` between the task running `start` and whatever
/// observes the stop signal.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
    listener: Mutex<Option<TcpListener>>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    state: watch::Sender<ServerState>,
    stats: Arc<ProxyStats>,
    next_conn_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            config,
            listener: Mutex::new(None),
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            state,
            stats: Arc::default(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until `start` has either bound the listener or given up, and
    /// returns the bound address if it is still listening.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != ServerState::Idle)
            .await
            .ok()?;
        state.local_addr()
    }

    /// Binds the listener, accepts until shutdown, then drains.
    ///
    /// Returns once every connection has finished or the grace period has
    /// elapsed, whichever comes first. Only startup faults are errors.
    pub async fn start(&self) -> Result<(), Error> {
        let (listener, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(err) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(err);
            }
        };

        *self.lock_listener() = Some(listener);
        self.state.send_replace(ServerState::Listening(local_addr));
        info!(%local_addr, backend = %self.config.backend, "ready to accept connections");

        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let abort = CancellationToken::new();

        self.accept_loop(&shutdown_complete_tx, &abort).await;

        // Shutdown closes the listener; this only catches a shutdown that
        // raced the bind above.
        drop(self.lock_listener().take());
        drop(shutdown_complete_tx);

        self.state.send_replace(ServerState::Draining);
        info!(
            outstanding = self.stats.active.load(Ordering::Acquire),
            grace_period = ?self.config.grace_period,
            "waiting for all connections to finish"
        );

        match time::timeout(self.config.grace_period, shutdown_complete_rx.recv()).await {
            Ok(_) => info!("all connections finished"),
            Err(_) => {
                let outstanding = self.stats.active.load(Ordering::Acquire);
                match self.config.drain_expiry {
                    DrainExpiry::ForceClose => {
                        warn!(outstanding, "graceful shutdown timeout, closing connections");
                        abort.cancel();
                    }
                    DrainExpiry::Abandon => {
                        warn!(outstanding, "graceful shutdown timeout, abandoning connections");
                    }
                }
            }
        }

        self.state.send_replace(ServerState::Stopped);
        Ok(())
    }

    /// Stops accepting and closes the listener. Safe to call repeatedly and
    /// concurrently; only the first call has any effect.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("shutting down proxy");
        self.cancel.cancel();

        let listener = self.lock_listener().take();
        if let Some(listener) = listener {
            let listener = listener.into_std().map_err(Error::CloseListener)?;
            drop(listener);
        }
        Ok(())
    }

    /// Runs [`start`](Self::start) and shuts down once `signal` resolves.
    pub async fn run_until(&self, signal: impl Future) -> Result<(), Error> {
        let start = self.start();
        tokio::pin!(start);

        tokio::select! {
            res = &mut start => return res,
            _ = signal => {
                if let Err(err) = self.shutdown() {
                    error!(cause = %err, "failed to shut down proxy");
                }
            }
        }

        start.await
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr), Error> {
        self.config.validate()?;

        let bind = &self.config.bind;
        let addrs = bind
            .resolve(self.config.network)
            .await
            .map_err(|source| Error::Resolve {
                endpoint: bind.to_string(),
                source,
            })?;

        // Resolution never yields an empty list.
        let addr = addrs[0];
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;
        Ok((listener, local_addr))
    }

    async fn accept_loop(&self, shutdown_complete: &mpsc::Sender<()>, abort: &CancellationToken) {
        let backoff_builder = accept_backoff();
        let mut backoff = backoff_builder.build();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                res = self.accept() => res,
            };

            match accepted {
                Ok((inbound, peer)) => {
                    backoff = backoff_builder.build();
                    self.dispatch(inbound, peer, shutdown_complete.clone(), abort.clone());
                }
                Err(err) if self.cancel.is_cancelled() => {
                    debug!(cause = %err, "accept interrupted by shutdown");
                }
                Err(err) => {
                    self.stats.accept_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next().unwrap_or(ACCEPT_BACKOFF_MAX);
                    error!(cause = %err, ?delay, "failed to accept connection");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = time::sleep(delay) => {}
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        future::poll_fn(|cx| match self.lock_listener().as_ref() {
            Some(listener) => listener.poll_accept(cx),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            ))),
        })
        .await
    }

    fn dispatch(
        &self,
        inbound: TcpStream,
        peer: SocketAddr,
        shutdown_complete: mpsc::Sender<()>,
        abort: CancellationToken,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.stats.accepted.fetch_add(1, Ordering::AcqRel);
        self.stats.active.fetch_add(1, Ordering::AcqRel);
        info!(conn_id, %peer, "new connection");

        let stats = Arc::clone(&self.stats);
        let forwarder = Forwarder::new(
            self.config.network,
            self.config.backend.clone(),
            Arc::clone(&self.stats),
        );

        tokio::spawn(
            async move {
                let _shutdown_complete = shutdown_complete;
                stats.dispatched.fetch_add(1, Ordering::AcqRel);

                match forwarder.run(conn_id, inbound, abort).await {
                    Ok(transfer) => info!(
                        sent = transfer.client_to_backend,
                        received = transfer.backend_to_client,
                        forced = transfer.forced,
                        "connection closed"
                    ),
                    Err(err) => error!(cause = ?err, "connection error"),
                }

                stats.active.fetch_sub(1, Ordering::AcqRel);
                stats.closed.fetch_add(1, Ordering::AcqRel);
            }
            .instrument(info_span!("connection", conn_id, %peer)),
        );
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delays between retries after accept errors; never runs out, so a long
/// EMFILE storm keeps the jittered cadence.
fn accept_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_jitter()
        .with_min_delay(ACCEPT_BACKOFF_MIN)
        .with_max_delay(ACCEPT_BACKOFF_MAX)
        .with_max_times(usize::MAX)
}
