use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Recognized configuration, loaded from TOML by the binary. Every field has
/// a default so a missing file or section still yields a runnable core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub agent_client: AgentClientConfig,
    pub registry: RegistryConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub event_queue_capacity: usize,
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            idle_timeout_seconds: 1800,
            event_queue_capacity: 256,
            sweep_interval_seconds: 60,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub parallel_max_in_flight: usize,
    pub process_max_in_flight: usize,
    pub default_timeout_seconds: u64,
    pub queue_overflow: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_max_in_flight: 16,
            process_max_in_flight: 256,
            default_timeout_seconds: 60,
            queue_overflow: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentClientConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// `allow` or `deny`; anything not matched by a rule falls here.
    pub default: String,
    pub reload_on_signal: bool,
    pub path: Option<PathBuf>,
    pub default_role: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default: "deny".to_string(),
            reload_on_signal: true,
            path: None,
            default_role: crate::context::DEFAULT_ROLE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.session.ttl_seconds, 3600);
        assert_eq!(cfg.session.idle_timeout_seconds, 1800);
        assert_eq!(cfg.session.event_queue_capacity, 256);
        assert_eq!(cfg.scheduler.parallel_max_in_flight, 16);
        assert_eq!(cfg.scheduler.process_max_in_flight, 256);
        assert_eq!(cfg.scheduler.default_timeout_seconds, 60);
        assert_eq!(cfg.agent_client.max_retries, 3);
        assert_eq!(cfg.agent_client.backoff_base_ms, 250);
        assert_eq!(cfg.agent_client.backoff_cap_ms, 4000);
        assert_eq!(cfg.registry.heartbeat_timeout_seconds, 30);
        assert_eq!(cfg.policy.default, "deny");
        assert!(cfg.policy.reload_on_signal);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: CoreConfig = toml::from_str(
            r#"
            [session]
            ttl_seconds = 120

            [scheduler]
            parallel_max_in_flight = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.session.ttl_seconds, 120);
        assert_eq!(cfg.session.event_queue_capacity, 256);
        assert_eq!(cfg.scheduler.parallel_max_in_flight, 4);
        assert_eq!(cfg.agent_client.max_retries, 3);
    }
}
