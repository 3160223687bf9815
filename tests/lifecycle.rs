use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tcprelay::{DrainExpiry, Endpoint, Error, ProxyConfig, ProxyServer, ServerState};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

struct Relay {
    server: Arc<ProxyServer>,
    handle: JoinHandle<Result<(), Error>>,
    addr: SocketAddr,
}

impl Relay {
    async fn spawn(config: ProxyConfig) -> Relay {
        let server = Arc::new(ProxyServer::new(config));
        let handle = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });
        let addr = server.listening().await.expect("relay should be listening");
        Relay {
            server,
            handle,
            addr,
        }
    }

    async fn stop(self) -> Duration {
        let started = Instant::now();
        self.server.shutdown().unwrap();
        time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("start should return")
            .unwrap()
            .unwrap();
        started.elapsed()
    }

    fn stat(&self, pick: fn(&tcprelay::ProxyStats) -> &std::sync::atomic::AtomicU64) -> u64 {
        pick(self.server.stats()).load(Ordering::SeqCst)
    }
}

fn relay_config(backend: SocketAddr) -> ProxyConfig {
    ProxyConfig::new(
        Endpoint::new("127.0.0.1", 0),
        Endpoint::new("127.0.0.1", backend.port()),
    )
    .with_grace_period(Duration::from_secs(2))
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_on(listener));
    addr
}

async fn echo_on(listener: TcpListener) {
    while let Ok((mut conn, _)) = listener.accept().await {
        tokio::spawn(async move {
            let (mut r, mut w) = conn.split();
            let _ = io::copy(&mut r, &mut w).await;
        });
    }
}

/// Accepts connections and never reads from or closes them.
async fn holding_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((conn, _)) = listener.accept().await {
            held.push(conn);
        }
    });
    addr
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        time::sleep(Duration::from_millis(10)).await;
    }
}

async fn ping(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn relays_bytes_exactly_in_order() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        let _ = received_tx.send(received);
    });

    let relay = Relay::spawn(relay_config(backend_addr)).await;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(&payload).await.unwrap();
    client.shutdown().await.unwrap();

    let received = time::timeout(Duration::from_secs(5), received_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload);

    drop(client);
    relay.stop().await;
}

#[tokio::test]
async fn byte_counts_match_each_direction() {
    const UP: usize = 70_000;
    const DOWN: usize = 12_345;

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut request = Vec::new();
        conn.read_to_end(&mut request).await.unwrap();
        assert_eq!(request.len(), UP);
        conn.write_all(&vec![7u8; DOWN]).await.unwrap();
    });

    let config = relay_config(backend_addr).with_grace_period(Duration::from_secs(5));
    let relay = Relay::spawn(config).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client.write_all(&vec![1u8; UP]).await.unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response.len(), DOWN);

    wait_until("connection close", || relay.stat(|s| &s.closed) == 1).await;
    assert_eq!(relay.stat(|s| &s.bytes_to_backend), UP as u64);
    assert_eq!(relay.stat(|s| &s.bytes_from_backend), DOWN as u64);

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent() {
    let relay = Relay::spawn(relay_config(echo_backend().await)).await;
    let server = Arc::clone(&relay.server);
    let addr = relay.addr;

    let concurrent: Vec<_> = (0..4)
        .map(|_| {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.shutdown() })
        })
        .collect();
    for call in concurrent {
        call.await.unwrap().unwrap();
    }
    assert!(server.is_shutting_down());

    relay.stop().await;
    server.shutdown().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn grace_period_bounds_start() {
    const CLIENTS: u64 = 3;
    let grace = Duration::from_millis(300);

    let config = relay_config(holding_backend().await).with_grace_period(grace);
    let relay = Relay::spawn(config).await;
    let server = Arc::clone(&relay.server);

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(TcpStream::connect(relay.addr).await.unwrap());
    }
    wait_until("connections dispatched", || relay.stat(|s| &s.active) == CLIENTS).await;

    let elapsed = relay.stop().await;
    assert!(elapsed >= grace, "returned after {elapsed:?}");
    assert!(elapsed < grace + Duration::from_secs(3), "returned after {elapsed:?}");

    // Forced close is the default expiry policy.
    wait_until("forced closes", || {
        server.stats().closed.load(Ordering::SeqCst) == CLIENTS
    })
    .await;
    for client in &mut clients {
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("client should observe the close");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}

#[tokio::test]
async fn abandon_leaves_connections_running() {
    let config = relay_config(echo_backend().await)
        .with_grace_period(Duration::from_millis(100))
        .with_drain_expiry(DrainExpiry::Abandon);
    let relay = Relay::spawn(config).await;
    let server = Arc::clone(&relay.server);

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    ping(&mut client, b"before").await;

    relay.stop().await;

    ping(&mut client, b"after shutdown").await;
    assert_eq!(server.stats().active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn drains_early_when_connections_close() {
    let grace = Duration::from_secs(30);
    let config = relay_config(echo_backend().await).with_grace_period(grace);
    let relay = Relay::spawn(config).await;

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = TcpStream::connect(relay.addr).await.unwrap();
        ping(&mut client, &[i; 16]).await;
        clients.push(client);
    }

    tokio::spawn(async move {
        time::sleep(Duration::from_millis(100)).await;
        drop(clients);
    });

    let elapsed = relay.stop().await;
    assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepted_connection_is_dispatched() {
    let relay = Relay::spawn(
        relay_config(echo_backend().await).with_grace_period(Duration::from_secs(5)),
    )
    .await;
    let server = Arc::clone(&relay.server);
    let addr = relay.addr;

    let clients: Vec<_> = (0..50)
        .map(|_| {
            tokio::spawn(async move {
                if let Ok(mut conn) = TcpStream::connect(addr).await {
                    let _ = conn.write_all(b"x").await;
                }
            })
        })
        .collect();

    wait_until("some accepts", || relay.stat(|s| &s.accepted) >= 10).await;
    relay.stop().await;
    for client in clients {
        client.await.unwrap();
    }

    let stats = server.stats();
    let accepted = stats.accepted.load(Ordering::SeqCst);
    assert!(accepted >= 10);
    assert_eq!(stats.dispatched.load(Ordering::SeqCst), accepted);
    assert_eq!(stats.closed.load(Ordering::SeqCst), accepted);
}

#[tokio::test]
async fn unreachable_backend_does_not_stop_accepting() {
    let port = closed_port().await;
    let relay = Relay::spawn(ProxyConfig::new(
        Endpoint::new("127.0.0.1", 0),
        Endpoint::new("127.0.0.1", port),
    ))
    .await;

    let mut first = TcpStream::connect(relay.addr).await.unwrap();
    let _ = first.write_all(b"x").await;
    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(5), first.read(&mut buf))
        .await
        .expect("failed connection should be closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    wait_until("dial failure", || relay.stat(|s| &s.dial_failures) == 1).await;
    assert_eq!(relay.server.state(), ServerState::Listening(relay.addr));

    let backend = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(echo_on(backend));

    let mut second = TcpStream::connect(relay.addr).await.unwrap();
    ping(&mut second, b"reachable now").await;
    drop(second);

    relay.stop().await;
}

#[tokio::test]
async fn bind_failure_is_a_startup_error() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let server = ProxyServer::new(ProxyConfig::new(
        Endpoint::new("127.0.0.1", port),
        Endpoint::new("127.0.0.1", closed_port().await),
    ));
    let err = server.start().await.unwrap_err();

    assert!(matches!(err, Error::Bind { .. }), "{err:?}");
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.listening().await, None);
}

#[tokio::test]
async fn empty_host_fails_startup() {
    let server = ProxyServer::new(ProxyConfig::new(
        Endpoint::new("", 0),
        Endpoint::new("127.0.0.1", 1),
    ));
    assert!(matches!(server.start().await, Err(Error::NoHost)));
}

#[tokio::test]
async fn shutdown_before_start_returns_promptly() {
    let server = ProxyServer::new(relay_config(echo_backend().await));
    server.shutdown().unwrap();

    time::timeout(Duration::from_secs(2), server.start())
        .await
        .expect("start should not block")
        .unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn run_until_stops_on_signal() {
    let server = Arc::new(ProxyServer::new(relay_config(echo_backend().await)));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run_until(stop_rx).await }
    });

    let addr = server.listening().await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    ping(&mut client, b"hi").await;
    drop(client);

    stop_tx.send(()).unwrap();
    time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(server.is_shutting_down());
}
