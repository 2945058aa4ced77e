//! Application configuration options

use std::time::Duration;

use crate::deploy::{ControllerOptions, StageTimeouts};
use crate::orchestrator::OrchestratorOptions;
use crate::proxy::DocumentOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::stream::FollowOptions;
use crate::workers::proxy;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Local HTTP server
    pub server: ServerOptions,

    /// External binaries and endpoints
    pub collaborators: CollaboratorOptions,

    /// Startup proxy push worker
    pub proxy_worker: proxy::Options,

    pub orchestrator: OrchestratorOptions,
}

impl AppOptions {
    /// Derive options from the settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let orchestrator = OrchestratorOptions {
            repos_dir: layout.repos_dir().path().to_path_buf(),
            port_range: (
                settings.runtime.port_range_start,
                settings.runtime.port_range_end,
            ),
            probe_ports: true,
            controller: ControllerOptions {
                network: Some(settings.runtime.network.clone()),
                ..ControllerOptions::default()
            },
            health_poll_interval: Duration::from_millis(settings.health.poll_interval_ms),
            timeouts: StageTimeouts {
                fetch: Duration::from_secs(settings.timeouts.clone_secs),
                build: Duration::from_secs(settings.timeouts.build_secs),
                rollout: Duration::from_secs(settings.timeouts.rollout_secs),
            },
            document: DocumentOptions {
                admin_listen: admin_listen(&settings.proxy.admin_url),
                listen: settings.proxy.listen.clone(),
                admin_ui_port: settings.proxy.admin_ui_port,
                acme_email: settings.proxy.acme_email.clone(),
            },
            follow: FollowOptions {
                tail: settings.runtime_logs.tail,
                timestamps: false,
                retry_delay: Duration::from_millis(settings.runtime_logs.retry_delay_ms),
            },
            system_domain_suffix: settings.system_domain_suffix.clone(),
            server_ip: settings.server_ip.clone(),
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            collaborators: CollaboratorOptions {
                docker_bin: settings.runtime.docker_bin.clone(),
                git_bin: settings.runtime.git_bin.clone(),
                network: settings.runtime.network.clone(),
                proxy_admin_url: settings.proxy.admin_url.clone(),
                probe_request_timeout: Duration::from_millis(settings.health.request_timeout_ms),
            },
            proxy_worker: proxy::Options::default(),
            orchestrator,
        }
    }
}

/// `host:port` of the admin API, kept in pushed configs so the proxy stays reachable
fn admin_listen(admin_url: &str) -> Option<String> {
    let url = url::Url::parse(admin_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Container runtime, git and proxy endpoints
#[derive(Debug, Clone)]
pub struct CollaboratorOptions {
    pub docker_bin: String,

    pub git_bin: String,

    /// Network created at startup if missing
    pub network: String,

    pub proxy_admin_url: String,

    /// Timeout of a single health probe request
    pub probe_request_timeout: Duration,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}
