//! Event hook execution for backend state changes.
//!
//! Operators can attach a command to a service; it runs whenever a
//! subscribed event fires (a backend entering cooldown, a failing backend
//! recovering, or a dial exhausting every backend). Context is passed both
//! as environment variables and as a JSON document on stdin. Executions are
//! fire-and-forget with a bounded timeout and never affect relay operation.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EventHookConfig;

/// Backend state change events a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BackendFailed,
    BackendRecovered,
    AllBackendsUnavailable,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::BackendFailed => "backend_failed",
            HookEvent::BackendRecovered => "backend_recovered",
            HookEvent::AllBackendsUnavailable => "all_backends_unavailable",
        }
    }
}

/// Context delivered to a hook command.
#[derive(Debug, Clone, Serialize)]
pub struct EventContext {
    pub event: HookEvent,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    pub failure_count: u8,
    pub timestamp: String,
}

impl EventContext {
    pub fn new(event: HookEvent, service: &str) -> Self {
        Self {
            event,
            service: service.to_string(),
            backend_host: None,
            backend_port: None,
            failure_count: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_backend(mut self, host: &str, port: u16, failure_count: u8) -> Self {
        self.backend_host = Some(host.to_string());
        self.backend_port = Some(port);
        self.failure_count = failure_count;
        self
    }
}

/// Executor for one service's configured event hook.
pub struct EventHook {
    service: String,
    command: String,
    args: Vec<String>,
    events: HashSet<HookEvent>,
    timeout: Duration,
}

impl EventHook {
    pub fn from_config(service: &str, config: &EventHookConfig) -> Self {
        Self {
            service: service.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            events: config.events.iter().copied().collect(),
            timeout: Duration::from_secs(config.timeout),
        }
    }

    pub fn is_subscribed(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }

    /// Fire the hook for an event. Returns immediately; the command runs in
    /// a detached task bounded by the configured timeout.
    pub fn fire(&self, ctx: EventContext) {
        if !self.is_subscribed(ctx.event) {
            return;
        }

        let service = self.service.clone();
        let command = self.command.clone();
        let args = self.args.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, run_hook(&command, &args, &ctx)).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(
                        service = %service,
                        event = ctx.event.as_str(),
                        command = %command,
                        "event hook completed"
                    );
                }
                Ok(Ok(status)) => {
                    warn!(
                        service = %service,
                        event = ctx.event.as_str(),
                        command = %command,
                        code = status.code(),
                        "event hook exited non-zero"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        service = %service,
                        event = ctx.event.as_str(),
                        command = %command,
                        error = %e,
                        "event hook failed to run"
                    );
                }
                Err(_) => {
                    warn!(
                        service = %service,
                        event = ctx.event.as_str(),
                        command = %command,
                        timeout_secs = timeout.as_secs(),
                        "event hook timed out"
                    );
                }
            }
        });
    }
}

async fn run_hook(
    command: &str,
    args: &[String],
    ctx: &EventContext,
) -> std::io::Result<std::process::ExitStatus> {
    let payload = serde_json::to_vec(ctx).unwrap_or_default();

    let mut cmd = Command::new(command);
    cmd.args(args)
        .env("RELAY_EVENT", ctx.event.as_str())
        .env("RELAY_SERVICE", &ctx.service)
        .env("RELAY_FAILURE_COUNT", ctx.failure_count.to_string())
        .env("RELAY_TIMESTAMP", &ctx.timestamp)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    if let Some(host) = &ctx.backend_host {
        cmd.env("RELAY_BACKEND_HOST", host);
    }
    if let Some(port) = ctx.backend_port {
        cmd.env("RELAY_BACKEND_PORT", port.to_string());
    }

    let mut child = cmd.spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // Hooks that never read stdin would see a broken pipe; ignore it.
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.shutdown().await;
    }

    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_config(events: Vec<HookEvent>) -> EventHookConfig {
        EventHookConfig {
            command: "/bin/true".to_string(),
            args: vec![],
            events,
            timeout: 5,
        }
    }

    #[test]
    fn subscription_filters_events() {
        let hook = EventHook::from_config("svc", &hook_config(vec![HookEvent::BackendFailed]));
        assert!(hook.is_subscribed(HookEvent::BackendFailed));
        assert!(!hook.is_subscribed(HookEvent::BackendRecovered));
        assert!(!hook.is_subscribed(HookEvent::AllBackendsUnavailable));
    }

    #[test]
    fn context_serializes_expected_fields() {
        let ctx = EventContext::new(HookEvent::BackendFailed, "svc").with_backend("db", 5432, 2);
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["event"], "backend_failed");
        assert_eq!(json["service"], "svc");
        assert_eq!(json["backend_host"], "db");
        assert_eq!(json["backend_port"], 5432);
        assert_eq!(json["failure_count"], 2);
    }

    #[test]
    fn context_without_backend_omits_fields() {
        let ctx = EventContext::new(HookEvent::AllBackendsUnavailable, "svc");
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("backend_host").is_none());
        assert!(json.get("backend_port").is_none());
    }
}
