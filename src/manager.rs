//! Service lifecycle and live reconfiguration.
//!
//! The manager owns the process-global DNS resolver and one record per
//! running service (backend pool plus TCP/UDP engines). Applying a
//! configuration snapshot reconciles the desired set against the running
//! set:
//! - removed services stop with a bounded drain grace
//! - added services get a fresh pool and listeners
//! - retained services restart only when the listen endpoint or protocol
//!   changed; backend-list and cooldown changes mutate the pool in place,
//!   preserving per-backend failure state by host+port identity
//!
//! Apply calls are serialized by `&mut self`; snapshots arrive from a single
//! producer at a time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{parse_backend, Config, ServiceConfig};
use crate::hooks::EventHook;
use crate::pool::{BackendPool, BackendSnapshot};
use crate::relay::{RelayStats, StatsSnapshot, TcpRelay, UdpRelay};
use crate::resolver::{CacheStats, DnsResolver};

/// How long removed TCP services may drain open sessions.
pub const TCP_DRAIN_GRACE: Duration = Duration::from_secs(5);

struct ManagedService {
    config: ServiceConfig,
    pool: Arc<BackendPool>,
    stats: Arc<RelayStats>,
    tcp: Option<TcpRelay>,
    udp: Option<UdpRelay>,
}

/// Status of one running service, for logs and the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub listen: String,
    pub protocol: String,
    pub stats: StatsSnapshot,
    pub backends: Vec<BackendSnapshot>,
}

/// Full process status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub services: Vec<ServiceStatus>,
    pub dns_cache: CacheStats,
}

/// Owns all running relay services and applies configuration snapshots.
pub struct ServiceManager {
    resolver: Arc<DnsResolver>,
    refresher: tokio::task::JoinHandle<()>,
    services: HashMap<String, ManagedService>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let resolver = Arc::new(DnsResolver::new());
        let refresher = resolver.spawn_refresher();
        Self {
            resolver,
            refresher,
            services: HashMap::new(),
        }
    }

    /// Number of services currently running.
    pub fn running(&self) -> usize {
        self.services.len()
    }

    /// Local TCP listen address of a running service, if it has one.
    pub fn tcp_addr(&self, service: &str) -> Option<SocketAddr> {
        self.services
            .get(service)
            .and_then(|s| s.tcp.as_ref())
            .map(|t| t.local_addr())
    }

    /// Local UDP listen address of a running service, if it has one.
    pub fn udp_addr(&self, service: &str) -> Option<SocketAddr> {
        self.services
            .get(service)
            .and_then(|s| s.udp.as_ref())
            .map(|u| u.local_addr())
    }

    /// Reconcile the running services against a configuration snapshot.
    ///
    /// Per-service failures (e.g. a listener that cannot bind) are logged
    /// and degrade that service only; other services are unaffected.
    pub async fn apply(&mut self, config: &Config) {
        let desired: HashMap<&str, &ServiceConfig> = config
            .services
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        let removed: Vec<String> = self
            .services
            .keys()
            .filter(|name| !desired.contains_key(name.as_str()))
            .cloned()
            .collect();

        for name in removed {
            self.remove_service(&name).await;
        }

        for svc in &config.services {
            if self.services.contains_key(&svc.name) {
                self.update_service(svc).await;
            } else if let Err(e) = self.start_service(svc).await {
                error!(service = %svc.name, error = %format!("{e:#}"), "failed to start service");
            }
        }

        info!(running = self.services.len(), "configuration applied");
    }

    /// Stop everything: equivalent to applying an empty snapshot.
    pub async fn shutdown(mut self) {
        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in names {
            self.remove_service(&name).await;
        }
        self.refresher.abort();
        info!("all services stopped");
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut services: Vec<ServiceStatus> = self
            .services
            .values()
            .map(|s| ServiceStatus {
                name: s.config.name.clone(),
                listen: s.config.listen.to_string(),
                protocol: s.config.protocol.to_string(),
                stats: s.stats.snapshot(),
                backends: s.pool.snapshot(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        StatusSnapshot {
            services,
            dns_cache: self.resolver.cache_stats(),
        }
    }

    async fn start_service(&mut self, svc: &ServiceConfig) -> Result<()> {
        let backends = parsed_backends(svc);
        let pool = Arc::new(BackendPool::new(
            &svc.name,
            &backends,
            Arc::clone(&self.resolver),
            Duration::from_secs(svc.backend_cooldown),
        ));
        pool.set_event_hook(
            svc.event_hook
                .as_ref()
                .map(|hc| Arc::new(EventHook::from_config(&svc.name, hc))),
        );

        let stats = Arc::new(RelayStats::default());
        let listen = SocketAddr::new(svc.listen.address, svc.listen.port);

        let tcp = if svc.protocol.tcp_enabled() {
            let relay = TcpRelay::bind(&svc.name, listen, Arc::clone(&pool), Arc::clone(&stats))
                .await
                .with_context(|| format!("failed to bind tcp listener on {}", svc.listen))?;
            Some(relay)
        } else {
            None
        };

        let udp = if svc.protocol.udp_enabled() {
            match UdpRelay::bind(&svc.name, listen, Arc::clone(&pool), Arc::clone(&stats)).await {
                Ok(relay) => Some(relay),
                Err(e) => {
                    // Service start is all-or-nothing: roll back the TCP
                    // listener before reporting the failure.
                    if let Some(tcp) = tcp {
                        tcp.stop(Duration::ZERO).await;
                    }
                    return Err(e)
                        .with_context(|| format!("failed to bind udp listener on {}", svc.listen));
                }
            }
        } else {
            None
        };

        info!(
            service = %svc.name,
            listen = %svc.listen,
            protocol = %svc.protocol,
            backends = backends.len(),
            "service started"
        );

        self.services.insert(
            svc.name.clone(),
            ManagedService {
                config: svc.clone(),
                pool,
                stats,
                tcp,
                udp,
            },
        );

        Ok(())
    }

    async fn remove_service(&mut self, name: &str) {
        let Some(service) = self.services.remove(name) else {
            return;
        };

        if let Some(tcp) = service.tcp {
            tcp.stop(TCP_DRAIN_GRACE).await;
        }
        if let Some(udp) = service.udp {
            udp.stop().await;
        }

        info!(service = %name, "service stopped");
    }

    async fn update_service(&mut self, svc: &ServiceConfig) {
        let needs_restart = {
            let Some(existing) = self.services.get(&svc.name) else {
                return;
            };
            existing.config.listen != svc.listen || existing.config.protocol != svc.protocol
        };

        if needs_restart {
            info!(service = %svc.name, "listen endpoint or protocol changed, restarting");
            self.remove_service(&svc.name).await;
            if let Err(e) = self.start_service(svc).await {
                error!(service = %svc.name, error = %format!("{e:#}"), "failed to restart service");
            }
            return;
        }

        let Some(existing) = self.services.get_mut(&svc.name) else {
            return;
        };

        if existing.config.backends != svc.backends {
            info!(service = %svc.name, "backend list changed");
            existing.pool.replace_backends(&parsed_backends(svc));
        }

        if existing.config.backend_cooldown != svc.backend_cooldown {
            info!(
                service = %svc.name,
                cooldown_secs = svc.backend_cooldown,
                "cooldown duration changed"
            );
            existing
                .pool
                .set_cooldown(Duration::from_secs(svc.backend_cooldown));
        }

        if existing.config.event_hook != svc.event_hook {
            info!(service = %svc.name, "event hook changed");
            existing.pool.set_event_hook(
                svc.event_hook
                    .as_ref()
                    .map(|hc| Arc::new(EventHook::from_config(&svc.name, hc))),
            );
        }

        existing.config = svc.clone();
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the validated backend strings of a service.
fn parsed_backends(svc: &ServiceConfig) -> Vec<(String, u16)> {
    svc.backends
        .iter()
        .filter_map(|b| match parse_backend(b) {
            Ok(pair) => Some(pair),
            Err(e) => {
                // Snapshots are validated upstream; an unparseable backend
                // here means the producer skipped validation.
                warn!(backend = %b, error = %e, "skipping unparseable backend");
                None
            }
        })
        .collect()
}
