//! Configuration schema and loader.
//!
//! The relay core consumes validated [`Config`] snapshots; this module
//! produces them from a YAML file. Backend addresses are kept as strings in
//! the schema (`host:port`, `ipv4:port`, or `[ipv6]:port`) and parsed with
//! [`parse_backend`] during validation and pool construction.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hooks::HookEvent;

/// Default per-backend cooldown after repeated failure, in seconds.
pub const DEFAULT_BACKEND_COOLDOWN_SECS: u64 = 1800;

/// Default event hook execution timeout, in seconds.
pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 30;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Backend string has no port separator.
    #[error("invalid backend '{0}': missing port")]
    MissingPort(String),

    /// Backend port is not a valid u16.
    #[error("invalid backend '{0}': bad port")]
    InvalidPort(String),

    /// Bracketed IPv6 backend is malformed.
    #[error("invalid backend '{0}': malformed [ipv6]:port form")]
    MalformedBracket(String),

    /// Two services share a name.
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    /// A service-level field is invalid.
    #[error("service '{name}': {reason}")]
    InvalidService { name: String, reason: String },

    /// The snapshot contains no services.
    #[error("no services configured")]
    NoServices,
}

/// Which protocols a service relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Both,
}

impl Protocol {
    pub fn tcp_enabled(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub fn udp_enabled(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Both => f.write_str("both"),
        }
    }
}

/// Local endpoint a service listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bare IP literal; wildcards `0.0.0.0` and `::` are allowed.
    pub address: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for ListenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
        }
    }
}

/// Event hook attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHookConfig {
    /// Command to execute (binary or script path).
    pub command: String,

    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Event types the hook subscribes to.
    #[serde(default)]
    pub events: Vec<HookEvent>,

    /// Execution timeout in seconds.
    #[serde(default = "default_hook_timeout")]
    pub timeout: u64,
}

fn default_hook_timeout() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

/// A single relay service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name, used as the stable identity across reloads.
    pub name: String,

    #[serde(default)]
    pub protocol: Protocol,

    pub listen: ListenConfig,

    /// Ordered backend list; the first reachable backend wins.
    pub backends: Vec<String>,

    /// Cooldown in seconds applied after a backend's second strike.
    /// Zero disables cooldown.
    #[serde(default = "default_backend_cooldown")]
    pub backend_cooldown: u64,

    #[serde(default)]
    pub event_hook: Option<EventHookConfig>,
}

fn default_backend_cooldown() -> u64 {
    DEFAULT_BACKEND_COOLDOWN_SECS
}

/// Root configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Parse a backend string into `(host, port)`.
///
/// Supported forms: `example.com:80`, `192.0.2.1:80`, `[2001:db8::1]:80`.
/// The bracketed IPv6 form loses its brackets.
pub fn parse_backend(backend: &str) -> Result<(String, u16), ConfigError> {
    if let Some(rest) = backend.strip_prefix('[') {
        let Some((host, port)) = rest.split_once("]:") else {
            return Err(ConfigError::MalformedBracket(backend.to_string()));
        };
        if host.is_empty() || host.contains(']') {
            return Err(ConfigError::MalformedBracket(backend.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(backend.to_string()))?;
        return Ok((host.to_string(), port));
    }

    let Some((host, port)) = backend.rsplit_once(':') else {
        return Err(ConfigError::MissingPort(backend.to_string()));
    };
    if host.is_empty() {
        return Err(ConfigError::MissingPort(backend.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(backend.to_string()))?;
    Ok((host.to_string(), port))
}

/// Validate a configuration snapshot.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.services.is_empty() {
        return Err(ConfigError::NoServices);
    }

    let mut seen = std::collections::HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            return Err(ConfigError::InvalidService {
                name: "<unnamed>".to_string(),
                reason: "name must be non-empty".to_string(),
            });
        }
        if !seen.insert(service.name.as_str()) {
            return Err(ConfigError::DuplicateService(service.name.clone()));
        }
        if service.listen.port == 0 {
            return Err(ConfigError::InvalidService {
                name: service.name.clone(),
                reason: "listen.port must be 1-65535".to_string(),
            });
        }
        if service.backends.is_empty() {
            return Err(ConfigError::InvalidService {
                name: service.name.clone(),
                reason: "at least one backend is required".to_string(),
            });
        }

        let mut parsed = std::collections::HashSet::new();
        for backend in &service.backends {
            let pair = parse_backend(backend)?;
            if !parsed.insert(pair) {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: format!("duplicate backend '{}'", backend),
                });
            }
        }

        if let Some(hook) = &service.event_hook {
            if hook.command.is_empty() {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: "event_hook.command must be non-empty".to_string(),
                });
            }
            if hook.timeout == 0 {
                return Err(ConfigError::InvalidService {
                    name: service.name.clone(),
                    reason: "event_hook.timeout must be > 0".to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    validate(&config).with_context(|| format!("invalid configuration in {}", path.display()))?;

    Ok(config)
}
