//! Settings file management

use serde::{Deserialize, Serialize};

use tracing::info;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Reverse proxy admin endpoint
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Container runtime and git binaries
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Per-stage deployment timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub runtime_logs: RuntimeLogSettings,

    /// Suffix for generated system domains (e.g. `apps.example.com`).
    /// No system domain is created when unset.
    #[serde(default)]
    pub system_domain_suffix: Option<String>,

    /// Public IPv4 of this host, used for DNS records and domain verification
    #[serde(default)]
    pub server_ip: Option<String>,
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when it is absent
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            info!(
                "No settings file at {}, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            EngineError::ConfigError(format!(
                "failed to read settings {}: {}",
                file.path().display(),
                e
            ))
        })
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), EngineError> {
        url::Url::parse(&self.proxy.admin_url).map_err(|e| {
            EngineError::ConfigError(format!(
                "invalid proxy admin url {}: {}",
                self.proxy.admin_url, e
            ))
        })?;

        if self.runtime.port_range_start == 0
            || self.runtime.port_range_start > self.runtime.port_range_end
        {
            return Err(EngineError::ConfigError(format!(
                "invalid port range {}-{}",
                self.runtime.port_range_start, self.runtime.port_range_end
            )));
        }

        if self.timeouts.clone_secs == 0
            || self.timeouts.build_secs == 0
            || self.timeouts.rollout_secs == 0
        {
            return Err(EngineError::ConfigError(
                "stage timeouts must be positive".to_string(),
            ));
        }

        if self.health.poll_interval_ms == 0 || self.health.request_timeout_ms == 0 {
            return Err(EngineError::ConfigError(
                "health probe intervals must be positive".to_string(),
            ));
        }

        if let Some(ip) = &self.server_ip {
            ip.parse::<std::net::Ipv4Addr>().map_err(|e| {
                EngineError::ConfigError(format!("invalid server ip {}: {}", ip, e))
            })?;
        }

        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7420
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Caddy admin API base URL
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Local port of the platform's admin UI, target of `frost-admin` routes
    #[serde(default = "default_admin_ui_port")]
    pub admin_ui_port: u16,

    /// ACME account email for automatic TLS
    #[serde(default)]
    pub acme_email: Option<String>,

    /// Listen addresses of the HTTP server block
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
}

fn default_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_admin_ui_port() -> u16 {
    3000
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string(), ":443".to_string()]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            admin_ui_port: default_admin_ui_port(),
            acme_email: None,
            listen: default_listen(),
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_git_bin")]
    pub git_bin: String,

    /// Docker network every service container joins
    #[serde(default = "default_network")]
    pub network: String,

    /// First host port handed out to replicas
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last host port handed out to replicas (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_network() -> String {
    "frost".to_string()
}

fn default_port_range_start() -> u16 {
    10000
}

fn default_port_range_end() -> u16 {
    20000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            git_bin: default_git_bin(),
            network: default_network(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
        }
    }
}

/// Stage timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_clone_secs")]
    pub clone_secs: u64,

    #[serde(default = "default_build_secs")]
    pub build_secs: u64,

    #[serde(default = "default_rollout_secs")]
    pub rollout_secs: u64,
}

fn default_clone_secs() -> u64 {
    300
}

fn default_build_secs() -> u64 {
    1800
}

fn default_rollout_secs() -> u64 {
    600
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            clone_secs: default_clone_secs(),
            build_secs: default_build_secs(),
            rollout_secs: default_rollout_secs(),
        }
    }
}

/// Health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Delay between probe attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout of a single probe request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    2000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Runtime log streaming settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLogSettings {
    /// Lines of history sent when a follower attaches
    #[serde(default = "default_tail")]
    pub tail: u32,

    /// Delay before re-opening a dropped log stream
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_tail() -> u32 {
    200
}

fn default_retry_delay_ms() -> u64 {
    3000
}

impl Default for RuntimeLogSettings {
    fn default() -> Self {
        Self {
            tail: default_tail(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_and_partial_file() {
        let dir = std::env::temp_dir().join(format!("frost-settings-{}", uuid::Uuid::new_v4()));
        let file = File::new(dir.join("settings.json"));

        let settings = Settings::load(&file).await.unwrap();
        assert_eq!(settings.server.port, 7420);

        file.write_atomic(br#"{"server": {"port": 9000}, "server_ip": "203.0.113.7"}"#)
            .await
            .unwrap();
        let settings = Settings::load(&file).await.unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server_ip.as_deref(), Some("203.0.113.7"));
        settings.validate().unwrap();

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_empty_json_yields_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.log_level, LogLevel::Info);
        assert_eq!(settings.proxy.admin_url, "http://localhost:2019");
        assert_eq!(settings.runtime.port_range_start, 10000);
        assert_eq!(settings.timeouts.build_secs, 1800);
        assert!(settings.system_domain_suffix.is_none());
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"runtime": {"network": "edge"}, "log_level": "debug"}"#)
                .unwrap();
        assert_eq!(settings.runtime.network, "edge");
        assert_eq!(settings.runtime.docker_bin, "docker");
        assert_eq!(settings.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.proxy.admin_url = "not a url".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.runtime.port_range_start = 30000;
        settings.runtime.port_range_end = 20000;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.timeouts.rollout_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.server_ip = Some("example.com".to_string());
        assert!(settings.validate().is_err());
    }
}
