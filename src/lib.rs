//! relayd
//!
//! Multi-service TCP/UDP layer-4 relay with sequential backend failover,
//! cached DNS resolution, per-backend cooldown, and live reconfiguration.
//!
//! Each configured service listens on a local endpoint, accepts client
//! traffic on TCP and/or UDP, and forwards it byte-for-byte to the first
//! reachable backend from an ordered list. Backends that fail repeatedly
//! enter a cooldown window and rotate to the tail of the list; a successful
//! dial resets them. Configuration snapshots can be re-applied at runtime
//! without disturbing unchanged services.

pub mod config;
pub mod hooks;
pub mod manager;
pub mod pool;
pub mod relay;
pub mod resolver;

pub use config::{Config, ListenConfig, Protocol, ServiceConfig};
pub use manager::{ServiceManager, ServiceStatus, StatusSnapshot};
pub use pool::{AllBackendsFailed, BackendId, BackendPool, BackendSnapshot, DialError};
pub use relay::{RelayStats, TcpRelay, UdpRelay};
pub use resolver::{DnsResolver, ResolveError};
