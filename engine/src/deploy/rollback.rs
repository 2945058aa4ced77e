//! Rollback coordinator
//!
//! Checks that an earlier deployment can be redeployed from its image
//! snapshot. The redeploy itself is a new deployment that enters the state
//! machine at the rollout stage.

use std::sync::Arc;

use tracing::info;

use crate::errors::EngineError;
use crate::models::{Deployment, Service};
use crate::runtime::ContainerRuntime;
use crate::store::Store;

/// A validated rollback
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub service: Service,

    /// Deployment being rolled back to; never mutated
    pub target: Deployment,

    /// Image snapshot to redeploy
    pub image: String,
}

pub struct RollbackCoordinator {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl RollbackCoordinator {
    pub fn new(store: Arc<dyn Store>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { store, runtime }
    }

    /// Check every precondition without side effects
    pub async fn plan(&self, deployment_id: &str) -> Result<RollbackPlan, EngineError> {
        let target = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", deployment_id)))?;

        let image = target.image_name.clone().ok_or_else(|| {
            EngineError::Validation(format!(
                "deployment {} has no image snapshot to roll back to",
                deployment_id
            ))
        })?;

        let service = self
            .store
            .get_service(&target.service_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("service {}", target.service_id)))?;

        if service.has_volumes() {
            return Err(EngineError::Validation(format!(
                "service {} has persistent volumes; rollback would not restore its data",
                service.name
            )));
        }

        if !self.runtime.image_exists(&image).await? {
            return Err(EngineError::ImageGone(format!(
                "image {} is no longer in the local image store",
                image
            )));
        }

        info!("Rollback of {} to {} planned", service.name, image);
        Ok(RollbackPlan {
            service,
            target,
            image,
        })
    }
}
