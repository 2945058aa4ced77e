//! Service models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default health check timeout in seconds
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 30;

/// Default drain timeout in seconds
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Where a service's image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Built from a git repository
    Repo,
    /// Pulled from an image reference
    Image,
    /// Database template, runs a fixed image with a volume
    Database,
}

impl SourceMode {
    /// Whether deployments of this mode go through clone and build
    pub fn needs_build(&self) -> bool {
        matches!(self, SourceMode::Repo)
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMode::Repo => write!(f, "repo"),
            SourceMode::Image => write!(f, "image"),
            SourceMode::Database => write!(f, "database"),
        }
    }
}

/// A named volume mounted into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Docker volume name
    pub name: String,

    /// Mount path inside the container
    pub path: String,
}

/// Container resource limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// CPU limit (fractional cores)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// A deployable unit owned by a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,

    pub project_id: String,

    pub name: String,

    pub source: SourceMode,

    /// Git repository URL (repo mode)
    #[serde(default)]
    pub repo_url: Option<String>,

    /// Git branch (repo mode)
    #[serde(default)]
    pub branch: Option<String>,

    /// Dockerfile path relative to the repository root
    #[serde(default = "default_dockerfile")]
    pub dockerfile_path: String,

    /// Build context subdirectory relative to the repository root
    #[serde(default)]
    pub build_context: Option<String>,

    /// Image reference (image and database modes)
    #[serde(default)]
    pub image_url: Option<String>,

    /// Port the application listens on inside the container
    pub container_port: u16,

    /// Health check path, probed over HTTP. `None` falls back to a TCP probe.
    #[serde(default)]
    pub health_check_path: Option<String>,

    /// Health check timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout: u64,

    /// Number of parallel replicas
    #[serde(default = "default_replica_count")]
    pub replica_count: u32,

    /// Grace period for superseded replicas, in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,

    /// Upstream response header timeout, in seconds
    #[serde(default)]
    pub request_timeout: Option<u64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub limits: ResourceLimits,

    /// Currently serving deployment
    #[serde(default)]
    pub current_deployment_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

fn default_replica_count() -> u32 {
    1
}

fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

/// Input for creating a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub project_id: String,

    /// Project name, used for the system domain
    pub project_name: String,

    pub name: String,

    pub source: SourceMode,

    #[serde(default)]
    pub repo_url: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default = "default_dockerfile")]
    pub dockerfile_path: String,

    #[serde(default)]
    pub build_context: Option<String>,

    #[serde(default)]
    pub image_url: Option<String>,

    pub container_port: u16,

    #[serde(default)]
    pub health_check_path: Option<String>,

    #[serde(default = "default_health_timeout")]
    pub health_check_timeout: u64,

    #[serde(default = "default_replica_count")]
    pub replica_count: u32,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,

    #[serde(default)]
    pub request_timeout: Option<u64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Partial settings update. Takes effect on the next deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSettingsUpdate {
    #[serde(default)]
    pub replica_count: Option<u32>,

    #[serde(default)]
    pub drain_timeout: Option<u64>,

    /// Empty string clears the path (TCP check)
    #[serde(default)]
    pub health_check_path: Option<String>,

    #[serde(default)]
    pub health_check_timeout: Option<u64>,

    /// Zero clears the timeout
    #[serde(default)]
    pub request_timeout: Option<u64>,

    #[serde(default)]
    pub container_port: Option<u16>,

    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub limits: Option<ResourceLimits>,

    #[serde(default)]
    pub image_url: Option<String>,

    #[serde(default)]
    pub branch: Option<String>,
}

/// Reject configurations the orchestrator cannot run
pub fn validate_service(service: &Service) -> Result<(), crate::errors::EngineError> {
    use crate::errors::EngineError;

    if service.name.trim().is_empty() {
        return Err(EngineError::Validation("service name is required".to_string()));
    }
    if service.container_port == 0 {
        return Err(EngineError::Validation("container port must be set".to_string()));
    }
    if service.replica_count < 1 {
        return Err(EngineError::Validation(
            "replica count must be at least 1".to_string(),
        ));
    }
    if service.has_volumes() && service.replica_count > 1 {
        return Err(EngineError::Validation(
            "services with persistent volumes are limited to one replica".to_string(),
        ));
    }
    if service.drain_timeout < 1 || service.health_check_timeout < 1 {
        return Err(EngineError::Validation(
            "drain and health check timeouts must be at least 1 second".to_string(),
        ));
    }
    match service.source {
        SourceMode::Repo if service.repo_url.as_deref().map_or(true, str::is_empty) => Err(
            EngineError::Validation("repo services need a repository url".to_string()),
        ),
        SourceMode::Image | SourceMode::Database
            if service.image_url.as_deref().map_or(true, str::is_empty) =>
        {
            Err(EngineError::Validation(format!(
                "{} services need an image reference",
                service.source
            )))
        }
        _ => Ok(()),
    }
}

impl Service {
    /// Build a service record from creation input
    pub fn from_new(input: NewService) -> Self {
        Self {
            id: super::new_id(),
            project_id: input.project_id,
            name: input.name,
            source: input.source,
            repo_url: input.repo_url,
            branch: input.branch,
            dockerfile_path: input.dockerfile_path,
            build_context: input.build_context,
            image_url: input.image_url,
            container_port: input.container_port,
            health_check_path: input.health_check_path,
            health_check_timeout: input.health_check_timeout,
            replica_count: input.replica_count,
            drain_timeout: input.drain_timeout,
            request_timeout: input.request_timeout,
            env: input.env,
            volumes: input.volumes,
            limits: input.limits,
            current_deployment_id: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a settings update in place
    pub fn apply(&mut self, update: ServiceSettingsUpdate) {
        if let Some(count) = update.replica_count {
            self.replica_count = count;
        }
        if let Some(drain) = update.drain_timeout {
            self.drain_timeout = drain;
        }
        if let Some(path) = update.health_check_path {
            self.health_check_path = (!path.trim().is_empty()).then_some(path);
        }
        if let Some(timeout) = update.health_check_timeout {
            self.health_check_timeout = timeout;
        }
        if let Some(timeout) = update.request_timeout {
            self.request_timeout = (timeout > 0).then_some(timeout);
        }
        if let Some(port) = update.container_port {
            self.container_port = port;
        }
        if let Some(env) = update.env {
            self.env = env;
        }
        if let Some(limits) = update.limits {
            self.limits = limits;
        }
        if let Some(image) = update.image_url {
            self.image_url = Some(image);
        }
        if let Some(branch) = update.branch {
            self.branch = Some(branch);
        }
    }

    /// Services with persistent volumes are pinned to one replica
    pub fn has_volumes(&self) -> bool {
        !self.volumes.is_empty()
    }

    /// Container name prefix shared by all replicas of this service
    pub fn container_prefix(&self) -> String {
        format!("frost-{}", crate::utils::slugify(&self.name, 40))
    }
}
