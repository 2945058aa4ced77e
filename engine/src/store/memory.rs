//! In-memory store with an optional JSON snapshot

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ServiceEdit, Store};
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::{Deployment, Domain, Replica, Service};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    services: BTreeMap<String, Service>,

    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,

    #[serde(default)]
    replicas: BTreeMap<String, Replica>,

    #[serde(default)]
    domains: BTreeMap<String, Domain>,
}

/// In-memory store
pub struct MemoryStore {
    tables: RwLock<Tables>,

    /// Snapshot file rewritten after every mutation
    snapshot: Option<File>,
}

impl MemoryStore {
    /// Create an empty, non-persistent store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it when present
    pub async fn open(snapshot: File) -> Result<Self, EngineError> {
        let tables = if snapshot.exists().await {
            let tables: Tables = snapshot.read_json().await.map_err(|e| {
                EngineError::StorageError(format!(
                    "failed to load {}: {}",
                    snapshot.path().display(),
                    e
                ))
            })?;
            info!(
                "Loaded state snapshot: {} services, {} deployments, {} domains",
                tables.services.len(),
                tables.deployments.len(),
                tables.domains.len()
            );
            tables
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(&self, tables: &Tables) -> Result<(), EngineError> {
        if let Some(file) = &self.snapshot {
            file.write_json_atomic(tables).await.map_err(|e| {
                EngineError::StorageError(format!(
                    "failed to write {}: {}",
                    file.path().display(),
                    e
                ))
            })?;
            debug!("State snapshot written");
        }
        Ok(())
    }

    /// Write the snapshot regardless of pending mutations
    pub async fn flush(&self) -> Result<(), EngineError> {
        let tables = self.tables.read().await;
        self.persist(&tables).await
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_service(&self, service: &Service) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        tables.services.insert(service.id.clone(), service.clone());
        self.persist(&tables).await
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>, EngineError> {
        Ok(self.tables.read().await.services.get(id).cloned())
    }

    async fn list_services(&self) -> Result<Vec<Service>, EngineError> {
        Ok(self.tables.read().await.services.values().cloned().collect())
    }

    async fn update_service(
        &self,
        id: &str,
        edit: ServiceEdit,
    ) -> Result<(Service, Service), EngineError> {
        let mut tables = self.tables.write().await;
        let before = tables
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("service {}", id)))?;
        let mut after = before.clone();
        edit(&mut after)?;
        tables.services.insert(id.to_string(), after.clone());
        self.persist(&tables).await?;
        Ok((before, after))
    }

    async fn put_deployment(&self, deployment: &Deployment) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        tables
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        self.persist(&tables).await
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError> {
        Ok(self.tables.read().await.deployments.get(id).cloned())
    }

    async fn list_deployments(&self, service_id: &str) -> Result<Vec<Deployment>, EngineError> {
        let tables = self.tables.read().await;
        let mut deployments: Vec<Deployment> = tables
            .deployments
            .values()
            .filter(|d| d.service_id == service_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn list_all_deployments(&self) -> Result<Vec<Deployment>, EngineError> {
        Ok(self.tables.read().await.deployments.values().cloned().collect())
    }

    async fn put_replica(&self, replica: &Replica) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        tables.replicas.insert(replica.id.clone(), replica.clone());
        self.persist(&tables).await
    }

    async fn list_replicas(&self, deployment_id: &str) -> Result<Vec<Replica>, EngineError> {
        let tables = self.tables.read().await;
        let mut replicas: Vec<Replica> = tables
            .replicas
            .values()
            .filter(|r| r.deployment_id == deployment_id)
            .cloned()
            .collect();
        replicas.sort_by_key(|r| r.replica_index);
        Ok(replicas)
    }

    async fn put_domain(&self, domain: &Domain) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        tables.domains.insert(domain.id.clone(), domain.clone());
        self.persist(&tables).await
    }

    async fn get_domain(&self, id: &str) -> Result<Option<Domain>, EngineError> {
        Ok(self.tables.read().await.domains.get(id).cloned())
    }

    async fn delete_domain(&self, id: &str) -> Result<Option<Domain>, EngineError> {
        let mut tables = self.tables.write().await;
        let removed = tables.domains.remove(id);
        if removed.is_some() {
            self.persist(&tables).await?;
        }
        Ok(removed)
    }

    async fn list_domains(&self) -> Result<Vec<Domain>, EngineError> {
        Ok(self.tables.read().await.domains.values().cloned().collect())
    }
}
