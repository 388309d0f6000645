//! End-to-end relay tests: client -> relay -> backend and back.


use std::sync::Arc;
use std::time::Duration;

use harness::{backend, dead_port, make_pool, try_roundtrip, TcpEchoBackend, UdpEchoBackend};
use relayd::{RelayStats, TcpRelay, UdpRelay};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

#[tokio::test]
async fn tcp_roundtrip_through_relay() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let pool = make_pool(vec![backend(echo.addr)], Duration::from_secs(60));
    let stats = Arc::new(RelayStats::default());

    let relay = TcpRelay::bind(
        "tcp-echo",
        "127.0.0.1:0".parse().unwrap(),
        pool,
        Arc::clone(&stats),
    )
    .await
    .unwrap();

    let reply = try_roundtrip(relay.local_addr(), b"hello relay").await.unwrap();
    assert_eq!(reply, b"hello relay");
    assert_eq!(echo.connection_count(), 1);
    assert_eq!(stats.snapshot().tcp_connections, 1);

    relay.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn tcp_relay_fails_over_to_healthy_backend() {
    let dead = dead_port().await;
    let echo = TcpEchoBackend::spawn().await.unwrap();

    let pool = make_pool(
        vec![("127.0.0.1".to_string(), dead), backend(echo.addr)],
        Duration::from_secs(60),
    );
    let stats = Arc::new(RelayStats::default());

    let relay = TcpRelay::bind("failover", "127.0.0.1:0".parse().unwrap(), pool, stats)
        .await
        .unwrap();

    let reply = try_roundtrip(relay.local_addr(), b"via backup").await.unwrap();
    assert_eq!(reply, b"via backup");
    assert_eq!(echo.connection_count(), 1);

    relay.stop(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn tcp_client_sees_close_when_all_backends_fail() {
    let dead = dead_port().await;
    let pool = make_pool(vec![("127.0.0.1".to_string(), dead)], Duration::from_secs(60));
    let stats = Arc::new(RelayStats::default());

    let relay = TcpRelay::bind("dead-end", "127.0.0.1:0".parse().unwrap(), pool, stats)
        .await
        .unwrap();

    // The relay accepts, exhausts the pool, and closes without sending bytes.
    let mut stream = TcpStream::connect(relay.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("relay should close the client promptly")
        .unwrap();
    assert_eq!(read, 0, "client should observe EOF with no payload");

    relay.stop(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn tcp_stop_closes_listener_and_sessions() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let pool = make_pool(vec![backend(echo.addr)], Duration::from_secs(60));
    let stats = Arc::new(RelayStats::default());

    let relay = TcpRelay::bind("stopping", "127.0.0.1:0".parse().unwrap(), pool, stats)
        .await
        .unwrap();
    let addr = relay.local_addr();

    // Hold a session open across the stop.
    let mut held = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.stop(Duration::from_millis(500)).await;

    // The held session is cut: reads terminate instead of hanging.
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), held.read(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

    // New connections are no longer served.
    let denied = timeout(Duration::from_millis(500), TcpStream::connect(addr)).await;
    assert!(!matches!(denied, Ok(Ok(_))), "listener should be closed");
}

#[tokio::test]
async fn udp_roundtrip_reuses_session() {
    let echo = UdpEchoBackend::spawn().await.unwrap();
    let pool = make_pool(vec![backend(echo.addr)], Duration::from_secs(60));
    let stats = Arc::new(RelayStats::default());

    let relay = UdpRelay::bind(
        "udp-echo",
        "127.0.0.1:0".parse().unwrap(),
        pool,
        Arc::clone(&stats),
    )
    .await
    .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    for payload in [&b"ping-1"[..], &b"ping-2"[..]] {
        client.send(payload).await.unwrap();
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply expected")
            .unwrap();
        assert_eq!(&buf[..n], payload);
    }

    assert_eq!(relay.session_count(), 1, "one client, one session");
    assert_eq!(echo.packet_count(), 2);
    assert_eq!(stats.snapshot().udp_active, 1);

    relay.stop().await;
}

#[tokio::test]
async fn udp_distinct_clients_get_distinct_sessions() {
    let echo = UdpEchoBackend::spawn().await.unwrap();
    let pool = make_pool(vec![backend(echo.addr)], Duration::from_secs(60));
    let stats = Arc::new(RelayStats::default());

    let relay = UdpRelay::bind("udp-multi", "127.0.0.1:0".parse().unwrap(), pool, stats)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    for i in 0..3u8 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(relay.local_addr()).await.unwrap();
        client.send(&[i]).await.unwrap();
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("reply expected")
            .unwrap();
        assert_eq!(&buf[..n], &[i]);
    }

    assert_eq!(relay.session_count(), 3);

    relay.stop().await;
}

#[tokio::test]
async fn udp_datagram_dropped_when_dial_fails() {
    let pool = make_pool(
        vec![("relayd-test.invalid".to_string(), 9)],
        Duration::from_secs(60),
    );
    let stats = Arc::new(RelayStats::default());

    let relay = UdpRelay::bind("udp-dead", "127.0.0.1:0".parse().unwrap(), pool, stats)
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(relay.local_addr()).await.unwrap();
    client.send(b"lost").await.unwrap();

    let mut buf = [0u8; 16];
    let reply = timeout(Duration::from_millis(1000), client.recv(&mut buf)).await;
    assert!(reply.is_err(), "no reply expected for a dropped datagram");
    assert_eq!(relay.session_count(), 0, "no session without a backend");

    relay.stop().await;
}
