//! Persistence seam for services, deployments, replicas and domains
//!
//! The orchestration path only ever sees typed records. Implementations carry
//! no business logic.

pub mod memory;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::models::{Deployment, Domain, Replica, Service};

pub use memory::MemoryStore;

/// In-place edit of a service row. An error leaves the row untouched.
pub type ServiceEdit = Box<dyn FnOnce(&mut Service) -> Result<(), EngineError> + Send>;

/// Typed CRUD over the orchestration records
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a service
    async fn put_service(&self, service: &Service) -> Result<(), EngineError>;

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EngineError>;

    async fn list_services(&self) -> Result<Vec<Service>, EngineError>;

    /// Apply an edit to a service as one atomic read-modify-write.
    /// Returns the row before and after the edit.
    async fn update_service(
        &self,
        id: &str,
        edit: ServiceEdit,
    ) -> Result<(Service, Service), EngineError>;

    /// Insert or replace a deployment
    async fn put_deployment(&self, deployment: &Deployment) -> Result<(), EngineError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError>;

    /// Deployments of a service, newest first
    async fn list_deployments(&self, service_id: &str) -> Result<Vec<Deployment>, EngineError>;

    /// Every deployment across all services
    async fn list_all_deployments(&self) -> Result<Vec<Deployment>, EngineError>;

    /// Insert or replace a replica
    async fn put_replica(&self, replica: &Replica) -> Result<(), EngineError>;

    /// Replicas of a deployment, ordered by replica index
    async fn list_replicas(&self, deployment_id: &str) -> Result<Vec<Replica>, EngineError>;

    /// Insert or replace a domain
    async fn put_domain(&self, domain: &Domain) -> Result<(), EngineError>;

    async fn get_domain(&self, id: &str) -> Result<Option<Domain>, EngineError>;

    async fn delete_domain(&self, id: &str) -> Result<Option<Domain>, EngineError>;

    async fn list_domains(&self) -> Result<Vec<Domain>, EngineError>;
}
