//! Backend pool with sequential failover.
//!
//! Each service owns one pool. A dial walks the ordered backend list and
//! returns the first upstream it can open, driving a two-strike state
//! machine per backend:
//! - first strike: the backend's DNS entry is invalidated and the same
//!   backend is retried once within the same dial, on fresh addresses
//! - second strike: the backend enters cooldown (if configured) and is
//!   rotated to the tail of the list
//!
//! Backends in cooldown are skipped when building the candidate order, but
//! cooldown is a hint, not a hard block: if every backend is cold the full
//! list is tried anyway. Any successful dial resets the backend's state.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::hooks::{EventContext, EventHook, HookEvent};
use crate::resolver::{DnsResolver, ResolveError};

/// Deadline for a single connect attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable backend identity within a service. Ids are allocated from a
/// per-pool counter and never recycled, so an id snapshotted by an in-flight
/// dial can never come to denote a different backend after a concurrent
/// backend-list replacement.
pub type BackendId = usize;

/// Failure to open one upstream connection attempt.
#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("udp socket for {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Every candidate backend was tried and none produced an upstream.
#[derive(Debug, Error)]
#[error("all backends failed for service '{service}' ({} attempted)", .attempts.len())]
pub struct AllBackendsFailed {
    pub service: String,
    /// `(backend id, last error)` per attempted backend, in attempt order.
    pub attempts: Vec<(BackendId, DialError)>,
}

#[derive(Debug)]
struct BackendState {
    id: BackendId,
    host: String,
    port: u16,
    original_index: usize,
    failures: u8,
    cooldown_until: Option<Instant>,
    last_error: Option<String>,
}

impl BackendState {
    fn new(id: BackendId, host: String, port: u16, original_index: usize) -> Self {
        Self {
            id,
            host,
            port,
            original_index,
            failures: 0,
            cooldown_until: None,
            last_error: None,
        }
    }
}

/// Observational view of one backend, for logs and the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub host: String,
    pub port: u16,
    pub original_index: usize,
    /// Current position in the dial order.
    pub position: usize,
    pub failures: u8,
    pub cooldown_remaining_secs: Option<u64>,
    #[serde(skip)]
    pub cooldown_until: Option<Instant>,
    pub last_error: Option<String>,
}

struct PoolState {
    backends: Vec<BackendState>,
    /// Next id handed to a newly installed backend; never decremented.
    next_id: BackendId,
    cooldown: Duration,
    hook: Option<Arc<EventHook>>,
}

/// Ordered backend list plus per-backend failure state for one service.
pub struct BackendPool {
    service: String,
    resolver: Arc<DnsResolver>,
    dial_timeout: Duration,
    state: Mutex<PoolState>,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: BackendId,
    host: String,
    port: u16,
}

enum Strike {
    /// First failure: caller invalidates DNS and retries the same backend.
    First,
    /// Second failure: cooldown and rotation applied, move on.
    Second,
}

impl BackendPool {
    pub fn new(
        service: &str,
        backends: &[(String, u16)],
        resolver: Arc<DnsResolver>,
        cooldown: Duration,
    ) -> Self {
        let backends: Vec<BackendState> = backends
            .iter()
            .enumerate()
            .map(|(i, (host, port))| BackendState::new(i, host.clone(), *port, i))
            .collect();
        let next_id = backends.len();

        Self {
            service: service.to_string(),
            resolver,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            state: Mutex::new(PoolState {
                backends,
                next_id,
                cooldown,
                hook: None,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set_event_hook(&self, hook: Option<Arc<EventHook>>) {
        self.lock().hook = hook;
    }

    /// Update the cooldown duration. Deadlines already computed are left
    /// untouched.
    pub fn set_cooldown(&self, cooldown: Duration) {
        self.lock().cooldown = cooldown;
    }

    /// Open a TCP connection to the first reachable backend.
    pub async fn dial(&self) -> Result<(TcpStream, BackendId), AllBackendsFailed> {
        let resolver = Arc::clone(&self.resolver);
        let timeout = self.dial_timeout;
        self.dial_inner(move |host, port| {
            let resolver = Arc::clone(&resolver);
            async move { connect_tcp(&resolver, timeout, &host, port).await }
        })
        .await
    }

    /// Open a UDP socket connected to one resolved address of the first
    /// eligible backend. UDP has no handshake, so failure here means DNS
    /// resolution or local socket creation failed; the same two-strike
    /// accounting applies.
    pub async fn dial_udp(&self) -> Result<(UdpSocket, BackendId), AllBackendsFailed> {
        let resolver = Arc::clone(&self.resolver);
        self.dial_inner(move |host, port| {
            let resolver = Arc::clone(&resolver);
            async move { connect_udp(&resolver, &host, port).await }
        })
        .await
    }

    /// Reset a backend's failure state after a successful dial.
    pub fn on_success(&self, id: BackendId) {
        self.reset_backend(|b| b.id == id);
    }

    /// Reset the backend a dial actually connected to. The id lookup is
    /// re-verified against the dialed host and port, so a backend list
    /// replaced while the connect was in flight is never mutated in error.
    fn mark_success(&self, c: &Candidate) {
        self.reset_backend(|b| b.id == c.id && b.host == c.host && b.port == c.port);
    }

    fn reset_backend(&self, matches: impl Fn(&BackendState) -> bool) {
        let mut event = None;
        {
            let mut state = self.lock();
            let hook = state.hook.clone();
            if let Some(b) = state.backends.iter_mut().find(|b| matches(b)) {
                if b.failures > 0 {
                    info!(
                        service = %self.service,
                        backend = %format_backend(&b.host, b.port),
                        "backend recovered"
                    );
                    event = hook.map(|h| {
                        let ctx = EventContext::new(HookEvent::BackendRecovered, &self.service)
                            .with_backend(&b.host, b.port, b.failures);
                        (h, ctx)
                    });
                }
                b.failures = 0;
                b.cooldown_until = None;
                b.last_error = None;
            }
        }
        if let Some((hook, ctx)) = event {
            hook.fire(ctx);
        }
    }

    /// Copy out the current state of every backend. Does not block dials
    /// beyond the brief state lock.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let now = Instant::now();
        let state = self.lock();
        state
            .backends
            .iter()
            .enumerate()
            .map(|(position, b)| BackendSnapshot {
                host: b.host.clone(),
                port: b.port,
                original_index: b.original_index,
                position,
                failures: b.failures,
                cooldown_remaining_secs: b
                    .cooldown_until
                    .filter(|t| *t > now)
                    .map(|t| (t - now).as_secs()),
                cooldown_until: b.cooldown_until,
                last_error: b.last_error.clone(),
            })
            .collect()
    }

    /// Install a new ordered backend list, preserving failure and cooldown
    /// state for backends that survive (same host and port). Surviving
    /// backends keep their stable id; new entries get fresh ids.
    pub fn replace_backends(&self, new: &[(String, u16)]) {
        let mut state = self.lock();
        let mut old = std::mem::take(&mut state.backends);

        let mut rebuilt = Vec::with_capacity(new.len());
        for (i, (host, port)) in new.iter().enumerate() {
            match old
                .iter()
                .position(|b| &b.host == host && b.port == *port)
            {
                Some(pos) => {
                    let mut b = old.remove(pos);
                    b.original_index = i;
                    rebuilt.push(b);
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    rebuilt.push(BackendState::new(id, host.clone(), *port, i));
                }
            }
        }
        state.backends = rebuilt;

        info!(
            service = %self.service,
            backends = state.backends.len(),
            dropped = old.len(),
            "backend list replaced"
        );
    }

    async fn dial_inner<C, F, T>(&self, connect: C) -> Result<(T, BackendId), AllBackendsFailed>
    where
        C: Fn(String, u16) -> F,
        F: std::future::Future<Output = Result<T, DialError>>,
    {
        let candidates = self.candidates();
        let mut attempts: Vec<(BackendId, DialError)> = Vec::new();

        for c in &candidates {
            match connect(c.host.clone(), c.port).await {
                Ok(upstream) => {
                    self.mark_success(c);
                    return Ok((upstream, c.id));
                }
                Err(err) => match self.note_failure(c, &err) {
                    Strike::First => {
                        self.resolver.invalidate(&c.host);
                        debug!(
                            service = %self.service,
                            backend = %format_backend(&c.host, c.port),
                            "retrying backend with fresh dns"
                        );
                        match connect(c.host.clone(), c.port).await {
                            Ok(upstream) => {
                                self.mark_success(c);
                                return Ok((upstream, c.id));
                            }
                            Err(err2) => {
                                self.note_failure(c, &err2);
                                attempts.push((c.id, err2));
                            }
                        }
                    }
                    Strike::Second => attempts.push((c.id, err)),
                },
            }
        }

        warn!(
            service = %self.service,
            attempted = attempts.len(),
            "all backends failed"
        );

        let event = {
            let state = self.lock();
            state.hook.clone().map(|h| {
                (
                    h,
                    EventContext::new(HookEvent::AllBackendsUnavailable, &self.service),
                )
            })
        };
        if let Some((hook, ctx)) = event {
            hook.fire(ctx);
        }

        Err(AllBackendsFailed {
            service: self.service.clone(),
            attempts,
        })
    }

    /// Build the candidate order for one dial: the current list with
    /// cooling backends skipped, or the full list when everything is cold.
    ///
    /// Backends at two strikes whose cooldown deadline has passed (or that
    /// never received one because cooldown is disabled) decay back to zero
    /// strikes here, so their next failure gets the DNS-refresh retry again.
    fn candidates(&self) -> Vec<Candidate> {
        let now = Instant::now();
        let mut state = self.lock();

        for b in &mut state.backends {
            if b.failures >= 2 && b.cooldown_until.map_or(true, |t| t <= now) {
                b.failures = 0;
                b.cooldown_until = None;
            }
        }

        let eligible: Vec<Candidate> = state
            .backends
            .iter()
            .filter(|b| b.cooldown_until.map_or(true, |t| t <= now))
            .map(Candidate::from_state)
            .collect();

        if eligible.is_empty() {
            debug!(service = %self.service, "all backends in cooldown, trying full list");
            state.backends.iter().map(Candidate::from_state).collect()
        } else {
            eligible
        }
    }

    fn note_failure(&self, c: &Candidate, err: &DialError) -> Strike {
        let mut event = None;
        let strike = {
            let mut state = self.lock();
            let cooldown = state.cooldown;
            let hook = state.hook.clone();

            let Some(pos) = state
                .backends
                .iter()
                .position(|b| b.id == c.id && b.host == c.host && b.port == c.port)
            else {
                // The backend was reconfigured away mid-dial; nothing to track.
                return Strike::Second;
            };

            let first_strike = state.backends[pos].failures == 0;
            if first_strike {
                let b = &mut state.backends[pos];
                b.failures = 1;
                b.last_error = Some(err.to_string());
                warn!(
                    service = %self.service,
                    backend = %format_backend(&b.host, b.port),
                    error = %err,
                    "backend dial failed (first strike)"
                );
                Strike::First
            } else {
                {
                    let b = &mut state.backends[pos];
                    b.failures = 2;
                    b.last_error = Some(err.to_string());
                    b.cooldown_until = if cooldown > Duration::ZERO {
                        Some(Instant::now() + cooldown)
                    } else {
                        None
                    };
                    warn!(
                        service = %self.service,
                        backend = %format_backend(&b.host, b.port),
                        error = %err,
                        cooldown_secs = cooldown.as_secs(),
                        "backend entered cooldown, rotating to tail"
                    );
                    event = hook.map(|h| {
                        let ctx = EventContext::new(HookEvent::BackendFailed, &self.service)
                            .with_backend(&b.host, b.port, b.failures);
                        (h, ctx)
                    });
                }
                let b = state.backends.remove(pos);
                state.backends.push(b);
                Strike::Second
            }
        };
        if let Some((hook, ctx)) = event {
            hook.fire(ctx);
        }
        strike
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Candidate {
    fn from_state(b: &BackendState) -> Candidate {
        Candidate {
            id: b.id,
            host: b.host.clone(),
            port: b.port,
        }
    }
}

fn format_backend(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn connect_tcp(
    resolver: &DnsResolver,
    timeout: Duration,
    host: &str,
    port: u16,
) -> Result<TcpStream, DialError> {
    let addrs = resolver.resolve(host).await?;

    let mut last: Option<DialError> = None;
    for ip in addrs {
        let addr = SocketAddr::new(ip, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(source)) => last = Some(DialError::Connect { addr, source }),
            Err(_) => last = Some(DialError::Timeout { addr, timeout }),
        }
    }

    Err(last.unwrap_or(DialError::Resolve(ResolveError::NoAddresses {
        host: host.to_string(),
    })))
}

async fn connect_udp(
    resolver: &DnsResolver,
    host: &str,
    port: u16,
) -> Result<UdpSocket, DialError> {
    let addrs = resolver.resolve(host).await?;

    let mut last: Option<DialError> = None;
    for ip in addrs {
        let addr = SocketAddr::new(ip, port);
        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(source) => {
                last = Some(DialError::Socket { addr, source });
                continue;
            }
        };

        match socket.connect(addr).await {
            Ok(()) => return Ok(socket),
            Err(source) => last = Some(DialError::Socket { addr, source }),
        }
    }

    Err(last.unwrap_or(DialError::Resolve(ResolveError::NoAddresses {
        host: host.to_string(),
    })))
}
