//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created, not yet started
    Pending,

    /// Cloning the repository
    Cloning,

    /// Pulling updates into an existing checkout
    Pulling,

    /// Building the image
    Building,

    /// Rolling out replicas
    Deploying,

    /// Serving traffic
    Running,

    Failed,

    Cancelled,

    /// Stopped manually
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Pulling => "pulling",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        }
    }

    /// Still moving through the pipeline
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Cloning | Self::Pulling | Self::Building | Self::Deploying
        )
    }

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Stopped)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "cloning" => Ok(Self::Cloning),
            "pulling" => Ok(Self::Pulling),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// What started a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentTrigger {
    /// Manual deploy or push
    Deploy,

    /// Redeploy of an earlier deployment's image
    Rollback { from_deployment_id: String },
}

/// One build-and-rollout attempt for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,

    pub service_id: String,

    pub status: DeploymentStatus,

    pub trigger: DeploymentTrigger,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub commit_sha: Option<String>,

    #[serde(default)]
    pub commit_message: Option<String>,

    /// Image the deployment runs, kept as the rollback snapshot
    #[serde(default)]
    pub image_name: Option<String>,

    /// Accumulated build log text
    #[serde(default)]
    pub build_log: String,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Host port of replica 0
    #[serde(default)]
    pub host_port: Option<u16>,

    /// Container id of replica 0
    #[serde(default)]
    pub container_id: Option<String>,
}

impl Deployment {
    /// Create a pending deployment for a service
    pub fn new(service_id: &str, trigger: DeploymentTrigger) -> Self {
        Self {
            id: super::new_id(),
            service_id: service_id.to_string(),
            status: DeploymentStatus::Pending,
            trigger,
            created_at: Utc::now(),
            finished_at: None,
            commit_sha: None,
            commit_message: None,
            image_name: None,
            build_log: String::new(),
            error_message: None,
            host_port: None,
            container_id: None,
        }
    }

    /// Short identifier used in image tags and container names
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}
