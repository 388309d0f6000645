//! UDP relay engine.
//!
//! One bound socket accepts datagrams from all clients. Each client address
//! gets a session with its own upstream socket, connected to one resolved
//! address of the first eligible backend. A per-session reader task forwards
//! upstream replies back through the listening socket, and a sweeper evicts
//! sessions idle past the timeout.
//!
//! Datagram handling runs inline in the receive loop, so datagrams within a
//! session are forwarded in arrival order.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RelayStats;
use crate::pool::BackendPool;

/// Datagram buffer; also the largest datagram the relay forwards.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// A session with no traffic for this long is evicted.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the sweeper scans the session table.
pub const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

struct UdpSession {
    upstream: Arc<UdpSocket>,
    /// Milliseconds since the engine's epoch, updated on every packet.
    last_activity: Arc<AtomicU64>,
    reader: JoinHandle<()>,
}

type SessionTable = Arc<Mutex<HashMap<SocketAddr, UdpSession>>>;

/// Handle to a running UDP relay engine.
pub struct UdpRelay {
    service: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
    sessions: SessionTable,
    stats: Arc<RelayStats>,
}

impl UdpRelay {
    /// Bind the listening socket and start receiving.
    pub async fn bind(
        service: &str,
        listen: SocketAddr,
        pool: Arc<BackendPool>,
        stats: Arc<RelayStats>,
    ) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let local_addr = socket.local_addr()?;

        info!(service, listen = %local_addr, "udp relay listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        let epoch = Instant::now();

        let recv_task = tokio::spawn(recv_loop(
            service.to_string(),
            Arc::clone(&socket),
            pool,
            Arc::clone(&stats),
            Arc::clone(&sessions),
            epoch,
            shutdown_rx.clone(),
        ));

        let sweep_task = tokio::spawn(sweep_loop(
            service.to_string(),
            Arc::clone(&sessions),
            Arc::clone(&stats),
            epoch,
            shutdown_rx,
        ));

        Ok(Self {
            service: service.to_string(),
            local_addr,
            shutdown,
            recv_task,
            sweep_task,
            sessions,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop receiving and drop every session immediately.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.recv_task.await;
        let _ = self.sweep_task.await;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for (_, session) in sessions.drain() {
            session.reader.abort();
            self.stats.udp_active.fetch_sub(1, Ordering::Relaxed);
        }

        info!(service = %self.service, "udp relay stopped");
    }
}

async fn recv_loop(
    service: String,
    socket: Arc<UdpSocket>,
    pool: Arc<BackendPool>,
    stats: Arc<RelayStats>,
    sessions: SessionTable,
    epoch: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    stats.udp_datagrams.fetch_add(1, Ordering::Relaxed);
                    handle_datagram(
                        &service,
                        &socket,
                        &pool,
                        &stats,
                        &sessions,
                        epoch,
                        &shutdown,
                        &buf[..len],
                        peer,
                    )
                    .await;
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "udp receive error");
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    service: &str,
    socket: &Arc<UdpSocket>,
    pool: &Arc<BackendPool>,
    stats: &Arc<RelayStats>,
    sessions: &SessionTable,
    epoch: Instant,
    shutdown: &watch::Receiver<bool>,
    data: &[u8],
    peer: SocketAddr,
) {
    // Fast path: an existing session forwards on its upstream socket.
    let existing = {
        let table = sessions.lock().unwrap_or_else(|e| e.into_inner());
        table.get(&peer).map(|s| {
            s.last_activity
                .store(elapsed_millis(epoch), Ordering::Relaxed);
            Arc::clone(&s.upstream)
        })
    };

    if let Some(upstream) = existing {
        if let Err(e) = upstream.send(data).await {
            warn!(service, peer = %peer, error = %e, "udp forward failed, dropping session");
            evict(sessions, stats, peer);
        }
        return;
    }

    // First packet from this client: dial a backend and set up the session.
    let (upstream, backend_id) = match pool.dial_udp().await {
        Ok(dialed) => dialed,
        Err(e) => {
            warn!(service, peer = %peer, error = %e, "dropping datagram, no backend");
            return;
        }
    };

    let upstream = Arc::new(upstream);
    let last_activity = Arc::new(AtomicU64::new(elapsed_millis(epoch)));

    let reader = tokio::spawn(session_reader(
        service.to_string(),
        Arc::clone(&upstream),
        Arc::clone(socket),
        peer,
        Arc::clone(&last_activity),
        epoch,
        shutdown.clone(),
    ));

    debug!(service, peer = %peer, backend_id, "udp session created");
    stats.udp_active.fetch_add(1, Ordering::Relaxed);
    {
        let mut table = sessions.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(
            peer,
            UdpSession {
                upstream: Arc::clone(&upstream),
                last_activity,
                reader,
            },
        );
    }

    if let Err(e) = upstream.send(data).await {
        warn!(service, peer = %peer, error = %e, "udp forward failed, dropping session");
        evict(sessions, stats, peer);
    }
}

/// Forward upstream replies back to the client via the listening socket.
async fn session_reader(
    service: String,
    upstream: Arc<UdpSocket>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    last_activity: Arc<AtomicU64>,
    epoch: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = upstream.recv(&mut buf) => match received {
                Ok(len) => {
                    last_activity.store(elapsed_millis(epoch), Ordering::Relaxed);
                    if let Err(e) = socket.send_to(&buf[..len], peer).await {
                        debug!(service = %service, peer = %peer, error = %e, "udp reply failed");
                    }
                }
                Err(e) => {
                    // Typically ICMP port-unreachable surfaced on the
                    // connected socket; the session dies and is either
                    // recreated by the next client packet or swept.
                    debug!(service = %service, peer = %peer, error = %e, "udp upstream error");
                    break;
                }
            },
        }
    }
}

async fn sweep_loop(
    service: String,
    sessions: SessionTable,
    stats: Arc<RelayStats>,
    epoch: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(UDP_SWEEP_INTERVAL) => {
                let now = elapsed_millis(epoch);
                let idle_millis = UDP_IDLE_TIMEOUT.as_millis() as u64;

                let mut table = sessions.lock().unwrap_or_else(|e| e.into_inner());
                let stale: Vec<SocketAddr> = table
                    .iter()
                    .filter(|(_, s)| {
                        now.saturating_sub(s.last_activity.load(Ordering::Relaxed)) > idle_millis
                    })
                    .map(|(peer, _)| *peer)
                    .collect();

                for peer in stale {
                    if let Some(session) = table.remove(&peer) {
                        session.reader.abort();
                        stats.udp_active.fetch_sub(1, Ordering::Relaxed);
                        debug!(service = %service, peer = %peer, "udp session evicted (idle)");
                    }
                }
            }
        }
    }
}

fn evict(sessions: &SessionTable, stats: &RelayStats, peer: SocketAddr) {
    let mut table = sessions.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(session) = table.remove(&peer) {
        session.reader.abort();
        stats.udp_active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn elapsed_millis(epoch: Instant) -> u64 {
    epoch.elapsed().as_millis() as u64
}
