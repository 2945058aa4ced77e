//! Engine API models

use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Returned when a deployment or rollback is admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAccepted {
    pub deployment_id: String,
}

/// Error body for every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Query of the runtime log stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeLogsQuery {
    /// Follow one replica only
    #[serde(default)]
    pub replica: Option<u32>,
}

/// One build log line, sent as SSE `data:`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogEvent {
    pub line: String,
}

/// One container output line, sent as SSE `data:`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLogEvent {
    pub replica_index: u32,
    pub line: String,
}

/// Final event of a build log stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEndEvent {
    pub status: String,
}
