//! Typed records for the orchestration boundary

pub mod deployment;
pub mod domain;
pub mod replica;
pub mod service;

pub use deployment::{Deployment, DeploymentStatus, DeploymentTrigger};
pub use domain::{Domain, DomainType, NewDomain, SslStatus};
pub use replica::{Replica, ReplicaStatus};
pub use service::{
    validate_service, NewService, ResourceLimits, Service, ServiceSettingsUpdate, SourceMode,
    VolumeMount,
};

/// Generate a new record identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
