//! Service manager reconfiguration under live traffic.


use std::time::Duration;

use harness::{dead_port, try_roundtrip, TcpEchoBackend};
use relayd::{Config, ListenConfig, Protocol, ServiceConfig, ServiceManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn tcp_service(name: &str, port: u16, backends: Vec<String>, cooldown: u64) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        protocol: Protocol::Tcp,
        listen: ListenConfig {
            address: "127.0.0.1".parse().unwrap(),
            port,
        },
        backends,
        backend_cooldown: cooldown,
        event_hook: None,
    }
}

#[tokio::test]
async fn apply_starts_services_and_relays_traffic() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let port = dead_port().await;

    let config = Config {
        services: vec![tcp_service("web", port, vec![echo.addr.to_string()], 60)],
    };

    let mut manager = ServiceManager::new();
    manager.apply(&config).await;
    assert_eq!(manager.running(), 1);

    let addr = manager.tcp_addr("web").unwrap();
    let reply = try_roundtrip(addr, b"through manager").await.unwrap();
    assert_eq!(reply, b"through manager");

    manager.shutdown().await;
}

#[tokio::test]
async fn reapplying_same_snapshot_keeps_sessions_alive() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let port = dead_port().await;

    let config = Config {
        services: vec![tcp_service("steady", port, vec![echo.addr.to_string()], 60)],
    };

    let mut manager = ServiceManager::new();
    manager.apply(&config).await;

    let addr = manager.tcp_addr("steady").unwrap();
    let mut held = TcpStream::connect(addr).await.unwrap();
    held.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    held.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    // A no-op apply must not restart the engine or cut the session.
    manager.apply(&config).await;
    assert_eq!(manager.tcp_addr("steady").unwrap(), addr);

    held.write_all(b"after!").await.unwrap();
    held.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");

    manager.shutdown().await;
}

#[tokio::test]
async fn backend_list_change_preserves_failure_state() {
    let dead = dead_port().await;
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let port = dead_port().await;

    let dead_backend = format!("127.0.0.1:{dead}");
    let live_backend = echo.addr.to_string();

    let config = Config {
        services: vec![tcp_service(
            "app",
            port,
            vec![dead_backend.clone(), live_backend.clone()],
            600,
        )],
    };

    let mut manager = ServiceManager::new();
    manager.apply(&config).await;

    // Drive one connection through: the dead backend collects two strikes
    // and enters cooldown, the live one serves the client.
    let addr = manager.tcp_addr("app").unwrap();
    let reply = try_roundtrip(addr, b"warmup").await.unwrap();
    assert_eq!(reply, b"warmup");

    // Reorder and extend the backend list.
    let added_backend = "192.0.2.42:7000".to_string();
    let reordered = Config {
        services: vec![tcp_service(
            "app",
            port,
            vec![
                live_backend.clone(),
                dead_backend.clone(),
                added_backend.clone(),
            ],
            600,
        )],
    };
    manager.apply(&reordered).await;

    let status = manager.status();
    let app = status.services.iter().find(|s| s.name == "app").unwrap();
    assert_eq!(app.backends.len(), 3);

    // New configured order, with per-backend state carried by host+port.
    assert_eq!(app.backends[0].port, echo.addr.port());
    assert_eq!(app.backends[0].failures, 0);
    assert_eq!(app.backends[1].port, dead);
    assert_eq!(app.backends[1].failures, 2);
    assert!(app.backends[1].cooldown_remaining_secs.is_some());
    assert_eq!(app.backends[2].port, 7000);
    assert_eq!(app.backends[2].failures, 0);

    // Sessions still flow after the swap.
    let reply = try_roundtrip(addr, b"post-swap").await.unwrap();
    assert_eq!(reply, b"post-swap");

    manager.shutdown().await;
}

#[tokio::test]
async fn removed_service_stops_listening() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let port_keep = dead_port().await;
    let port_drop = dead_port().await;

    let both = Config {
        services: vec![
            tcp_service("keep", port_keep, vec![echo.addr.to_string()], 60),
            tcp_service("drop", port_drop, vec![echo.addr.to_string()], 60),
        ],
    };

    let mut manager = ServiceManager::new();
    manager.apply(&both).await;
    assert_eq!(manager.running(), 2);

    let keep_addr = manager.tcp_addr("keep").unwrap();
    let drop_addr = manager.tcp_addr("drop").unwrap();

    let only_keep = Config {
        services: vec![tcp_service("keep", port_keep, vec![echo.addr.to_string()], 60)],
    };
    manager.apply(&only_keep).await;
    assert_eq!(manager.running(), 1);

    let reply = try_roundtrip(keep_addr, b"still here").await.unwrap();
    assert_eq!(reply, b"still here");

    let denied = timeout(Duration::from_millis(500), TcpStream::connect(drop_addr)).await;
    assert!(
        !matches!(denied, Ok(Ok(_))),
        "removed service should not accept connections"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn listen_change_restarts_service() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let old_port = dead_port().await;
    let new_port = dead_port().await;

    let mut manager = ServiceManager::new();
    manager
        .apply(&Config {
            services: vec![tcp_service("mv", old_port, vec![echo.addr.to_string()], 60)],
        })
        .await;
    let old_addr = manager.tcp_addr("mv").unwrap();

    manager
        .apply(&Config {
            services: vec![tcp_service("mv", new_port, vec![echo.addr.to_string()], 60)],
        })
        .await;

    let new_addr = manager.tcp_addr("mv").unwrap();
    assert_ne!(old_addr, new_addr);

    let reply = try_roundtrip(new_addr, b"moved").await.unwrap();
    assert_eq!(reply, b"moved");

    let denied = timeout(Duration::from_millis(500), TcpStream::connect(old_addr)).await;
    assert!(!matches!(denied, Ok(Ok(_))), "old listener should be gone");

    manager.shutdown().await;
}

#[tokio::test]
async fn cooldown_change_keeps_backend_state() {
    let dead = dead_port().await;
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let port = dead_port().await;

    let backends = vec![format!("127.0.0.1:{dead}"), echo.addr.to_string()];

    let mut manager = ServiceManager::new();
    manager
        .apply(&Config {
            services: vec![tcp_service("tune", port, backends.clone(), 600)],
        })
        .await;

    let addr = manager.tcp_addr("tune").unwrap();
    try_roundtrip(addr, b"strike").await.unwrap();

    let before = manager.status();
    let cooling = before.services[0]
        .backends
        .iter()
        .find(|b| b.failures == 2)
        .expect("dead backend should be cooling")
        .cooldown_remaining_secs;

    // Only the duration changes; the existing deadline is not rewritten.
    manager
        .apply(&Config {
            services: vec![tcp_service("tune", port, backends, 30)],
        })
        .await;

    let after = manager.status();
    let still_cooling = after.services[0]
        .backends
        .iter()
        .find(|b| b.failures == 2)
        .expect("backend state should survive a cooldown change")
        .cooldown_remaining_secs;

    assert!(still_cooling.unwrap() > 30, "deadline should not shrink");
    assert!(still_cooling.unwrap() <= cooling.unwrap());

    manager.shutdown().await;
}
