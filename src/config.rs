//! Instancer configuration
//!
//! Environment-driven settings for the proxy directories, instance TTLs,
//! the wildcard challenge domain, and the terminal bridge.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancerConfig {
    /// Container registry used to resolve bare image names (`DOCKER_REGISTRY`).
    pub docker_registry: String,
    /// Wildcard domain suffix for instance hostnames (`CHALLENGE_DOMAIN`).
    pub challenge_domain: String,
    /// Default instance TTL in seconds (`DEFAULT_INSTANCE_TTL`).
    pub default_instance_ttl_secs: u64,
    /// Expiry sweep interval in seconds (`INSTANCE_CLEANUP_INTERVAL`).
    pub instance_cleanup_interval_secs: u64,
    /// Directory holding rendered per-instance proxy configs.
    pub sites_available: PathBuf,
    /// Directory of enabling symlinks picked up by the proxy.
    pub sites_enabled: PathBuf,
    /// Canonical path of the route template, written by `init`.
    pub template_path: PathBuf,
    /// Debounce window for coalescing proxy reloads, in milliseconds.
    pub reload_debounce_ms: u64,
    /// SQLite file backing the instance registry (`INSTANCER_DB`).
    pub registry_path: PathBuf,
    /// Terminal sessions idle longer than this are closed.
    pub terminal_idle_timeout_secs: u64,
    /// Shared secret expected in the terminal `token` query parameter
    /// (`TERMINAL_SESSION_TOKEN`). Unset leaves the endpoint open for
    /// deployments behind the platform's own auth.
    pub session_token: Option<String>,
    /// Port assumed for challenge services without an explicit port label.
    pub default_challenge_port: u16,
}

impl Default for InstancerConfig {
    fn default() -> Self {
        Self {
            docker_registry: "localhost:5000".to_string(),
            challenge_domain: "challenges.local".to_string(),
            default_instance_ttl_secs: 3600,
            instance_cleanup_interval_secs: 300,
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            template_path: PathBuf::from("/etc/instancer/route.conf.template"),
            reload_debounce_ms: 300,
            registry_path: PathBuf::from("/var/lib/instancer/registry.db"),
            terminal_idle_timeout_secs: 600,
            session_token: None,
            default_challenge_port: 80,
        }
    }
}

impl InstancerConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_registry: env_or("DOCKER_REGISTRY", defaults.docker_registry),
            challenge_domain: env_or("CHALLENGE_DOMAIN", defaults.challenge_domain),
            default_instance_ttl_secs: env_parse(
                "DEFAULT_INSTANCE_TTL",
                defaults.default_instance_ttl_secs,
            ),
            instance_cleanup_interval_secs: env_parse(
                "INSTANCE_CLEANUP_INTERVAL",
                defaults.instance_cleanup_interval_secs,
            ),
            sites_available: env_path("PROXY_SITES_AVAILABLE", defaults.sites_available),
            sites_enabled: env_path("PROXY_SITES_ENABLED", defaults.sites_enabled),
            template_path: env_path("PROXY_TEMPLATE_PATH", defaults.template_path),
            reload_debounce_ms: env_parse("PROXY_RELOAD_DEBOUNCE_MS", defaults.reload_debounce_ms),
            registry_path: env_path("INSTANCER_DB", defaults.registry_path),
            terminal_idle_timeout_secs: env_parse(
                "TERMINAL_IDLE_TIMEOUT",
                defaults.terminal_idle_timeout_secs,
            ),
            session_token: std::env::var("TERMINAL_SESSION_TOKEN").ok(),
            default_challenge_port: env_parse(
                "DEFAULT_CHALLENGE_PORT",
                defaults.default_challenge_port,
            ),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_instance_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.instance_cleanup_interval_secs)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn terminal_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.terminal_idle_timeout_secs)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_platform_settings() {
        let config = InstancerConfig::default();
        assert_eq!(config.default_instance_ttl_secs, 3600);
        assert_eq!(config.instance_cleanup_interval_secs, 300);
        assert_eq!(config.docker_registry, "localhost:5000");
        assert_eq!(config.default_challenge_port, 80);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_overrides() {
        std::env::set_var("DEFAULT_INSTANCE_TTL", "120");
        std::env::set_var("CHALLENGE_DOMAIN", "challenges.ctf.example");
        let config = InstancerConfig::from_env();
        assert_eq!(config.default_instance_ttl_secs, 120);
        assert_eq!(config.challenge_domain, "challenges.ctf.example");
        std::env::remove_var("DEFAULT_INSTANCE_TTL");
        std::env::remove_var("CHALLENGE_DOMAIN");
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_ignores_garbage() {
        std::env::set_var("INSTANCE_CLEANUP_INTERVAL", "not-a-number");
        let config = InstancerConfig::from_env();
        assert_eq!(config.instance_cleanup_interval_secs, 300);
        std::env::remove_var("INSTANCE_CLEANUP_INTERVAL");
    }
}
