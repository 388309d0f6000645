//! TCP and UDP relay engines.
//!
//! Both engines share a service's [`BackendPool`](crate::pool::BackendPool)
//! and a [`RelayStats`] block. They are byte-transparent: no framing, no
//! inspection, no modification of relayed traffic.

pub mod tcp;
pub mod udp;

pub use tcp::TcpRelay;
pub use udp::UdpRelay;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-service traffic counters, shared by both engines.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total TCP connections accepted.
    pub tcp_connections: AtomicU64,
    /// TCP sessions currently open.
    pub tcp_active: AtomicU64,
    /// Bytes copied client -> upstream.
    pub tcp_bytes_to_backend: AtomicU64,
    /// Bytes copied upstream -> client.
    pub tcp_bytes_from_backend: AtomicU64,
    /// Total UDP datagrams received from clients.
    pub udp_datagrams: AtomicU64,
    /// UDP sessions currently tracked.
    pub udp_active: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub tcp_connections: u64,
    pub tcp_active: u64,
    pub tcp_bytes_to_backend: u64,
    pub tcp_bytes_from_backend: u64,
    pub udp_datagrams: u64,
    pub udp_active: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp_connections: self.tcp_connections.load(Ordering::Relaxed),
            tcp_active: self.tcp_active.load(Ordering::Relaxed),
            tcp_bytes_to_backend: self.tcp_bytes_to_backend.load(Ordering::Relaxed),
            tcp_bytes_from_backend: self.tcp_bytes_from_backend.load(Ordering::Relaxed),
            udp_datagrams: self.udp_datagrams.load(Ordering::Relaxed),
            udp_active: self.udp_active.load(Ordering::Relaxed),
        }
    }
}
