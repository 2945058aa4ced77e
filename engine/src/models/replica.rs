//! Replica models

use serde::{Deserialize, Serialize};

/// Replica status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Pending,
    Running,
    Failed,
    Stopped,
}

/// One running container instance of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: String,

    pub deployment_id: String,

    /// 0-based, stable ordering within the deployment
    pub replica_index: u32,

    #[serde(default)]
    pub container_id: Option<String>,

    pub host_port: u16,

    pub status: ReplicaStatus,
}

impl Replica {
    pub fn new(deployment_id: &str, replica_index: u32, host_port: u16) -> Self {
        Self {
            id: super::new_id(),
            deployment_id: deployment_id.to_string(),
            replica_index,
            container_id: None,
            host_port,
            status: ReplicaStatus::Pending,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ReplicaStatus::Running
    }
}
