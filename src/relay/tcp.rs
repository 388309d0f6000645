//! TCP relay engine.
//!
//! One accept loop per service. Each accepted client gets a dial through
//! the backend pool and a byte-for-byte splice in both directions with a
//! shared idle timeout. Errors on an established session close the session
//! only; the pool's failure accounting is strictly about dialing.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::RelayStats;
use crate::pool::BackendPool;

/// Copy buffer per direction.
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// A session with no activity in either direction for this long is closed.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle to a running TCP relay engine.
pub struct TcpRelay {
    service: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TcpRelay {
    /// Bind the listening socket and start accepting.
    pub async fn bind(
        service: &str,
        listen: SocketAddr,
        pool: Arc<BackendPool>,
        stats: Arc<RelayStats>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;

        info!(service, listen = %local_addr, "tcp relay listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::spawn(accept_loop(
            service.to_string(),
            listener,
            pool,
            stats,
            Arc::clone(&sessions),
            shutdown_rx,
        ));

        Ok(Self {
            service: service.to_string(),
            local_addr,
            shutdown,
            accept_task,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, signal open sessions to close, and wait up to `grace`
    /// for them to finish before aborting the stragglers.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;

        let handles: Vec<JoinHandle<()>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain(..).collect()
        };

        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            if handle.is_finished() {
                continue;
            }
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                // Grace period exhausted; cut the session off.
                handle.abort();
            }
        }

        info!(service = %self.service, "tcp relay stopped");
    }
}

async fn accept_loop(
    service: String,
    listener: TcpListener,
    pool: Arc<BackendPool>,
    stats: Arc<RelayStats>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    debug!(service = %service, peer = %peer, "tcp client accepted");
                    stats.tcp_connections.fetch_add(1, Ordering::Relaxed);

                    let handle = tokio::spawn(handle_client(
                        service.clone(),
                        client,
                        peer,
                        Arc::clone(&pool),
                        Arc::clone(&stats),
                        shutdown.clone(),
                    ));

                    let mut sessions = sessions.lock().unwrap_or_else(|e| e.into_inner());
                    sessions.retain(|h| !h.is_finished());
                    sessions.push(handle);
                }
                Err(e) => {
                    error!(service = %service, error = %e, "accept error");
                    // Avoid a tight loop on persistent accept errors.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_client(
    service: String,
    client: TcpStream,
    peer: SocketAddr,
    pool: Arc<BackendPool>,
    stats: Arc<RelayStats>,
    shutdown: watch::Receiver<bool>,
) {
    let (upstream, backend_id) = match pool.dial().await {
        Ok(dialed) => dialed,
        Err(e) => {
            warn!(service = %service, peer = %peer, error = %e, "closing client, no backend");
            return;
        }
    };

    debug!(service = %service, peer = %peer, backend_id, "tcp session open");

    stats.tcp_active.fetch_add(1, Ordering::Relaxed);
    splice(client, upstream, &service, peer, &stats, shutdown).await;
    stats.tcp_active.fetch_sub(1, Ordering::Relaxed);

    debug!(service = %service, peer = %peer, "tcp session closed");
}

/// Bidirectional copy with half-close on EOF and a shared idle timeout.
///
/// Runs as one duplex loop: EOF in a direction half-closes the peer's write
/// side and stops polling that direction; any I/O error or the idle deadline
/// closes both sockets.
async fn splice(
    client: TcpStream,
    upstream: TcpStream,
    service: &str,
    peer: SocketAddr,
    stats: &RelayStats,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut client_buf = vec![0u8; TCP_BUFFER_SIZE];
    let mut upstream_buf = vec![0u8; TCP_BUFFER_SIZE];

    let mut client_open = true;
    let mut upstream_open = true;
    let mut last_activity = tokio::time::Instant::now();

    while client_open || upstream_open {
        tokio::select! {
            read = client_read.read(&mut client_buf), if client_open => match read {
                Ok(0) => {
                    client_open = false;
                    let _ = upstream_write.shutdown().await;
                }
                Ok(n) => {
                    if let Err(e) = upstream_write.write_all(&client_buf[..n]).await {
                        warn!(service, peer = %peer, error = %e, "upstream write error");
                        return;
                    }
                    stats.tcp_bytes_to_backend.fetch_add(n as u64, Ordering::Relaxed);
                    last_activity = tokio::time::Instant::now();
                }
                Err(e) => {
                    warn!(service, peer = %peer, error = %e, "client read error");
                    return;
                }
            },
            read = upstream_read.read(&mut upstream_buf), if upstream_open => match read {
                Ok(0) => {
                    upstream_open = false;
                    let _ = client_write.shutdown().await;
                }
                Ok(n) => {
                    if let Err(e) = client_write.write_all(&upstream_buf[..n]).await {
                        warn!(service, peer = %peer, error = %e, "client write error");
                        return;
                    }
                    stats.tcp_bytes_from_backend.fetch_add(n as u64, Ordering::Relaxed);
                    last_activity = tokio::time::Instant::now();
                }
                Err(e) => {
                    warn!(service, peer = %peer, error = %e, "upstream read error");
                    return;
                }
            },
            _ = tokio::time::sleep_until(last_activity + TCP_IDLE_TIMEOUT) => {
                debug!(service, peer = %peer, "tcp session idle, closing");
                return;
            }
            _ = shutdown.changed() => {
                debug!(service, peer = %peer, "tcp session closed by shutdown");
                return;
            }
        }
    }
}
