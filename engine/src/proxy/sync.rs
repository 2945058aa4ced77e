//! Reverse proxy synchronizer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::document::{build_document, CaddyConfig, DocumentOptions, ServiceUpstreams};
use crate::errors::EngineError;
use crate::models::ReplicaStatus;
use crate::store::Store;
use crate::utils::sha256_hash;

/// Accepts a full routing document and applies it without dropping connections
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    async fn load(&self, document: &CaddyConfig) -> Result<(), EngineError>;
}

/// Caddy admin API client
pub struct CaddyAdmin {
    client: reqwest::Client,
    load_url: String,
}

impl CaddyAdmin {
    pub fn new(admin_url: &str) -> Result<Self, EngineError> {
        let base = url::Url::parse(admin_url)
            .map_err(|e| EngineError::ConfigError(format!("invalid proxy admin url: {}", e)))?;
        let load_url = base
            .join("/load")
            .map_err(|e| EngineError::ConfigError(format!("invalid proxy admin url: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            load_url: load_url.to_string(),
        })
    }
}

#[async_trait]
impl ReverseProxy for CaddyAdmin {
    async fn load(&self, document: &CaddyConfig) -> Result<(), EngineError> {
        let response = self
            .client
            .post(&self.load_url)
            .json(document)
            .send()
            .await
            .map_err(|e| EngineError::Infrastructure(format!("proxy load failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Infrastructure(format!(
                "proxy rejected config ({}): {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}

/// Derives the routing document from the store and pushes it when it changed
pub struct ProxySynchronizer {
    store: Arc<dyn Store>,
    proxy: Arc<dyn ReverseProxy>,
    options: DocumentOptions,

    /// Hash of the last document the proxy accepted
    last_pushed: Mutex<Option<String>>,
}

impl ProxySynchronizer {
    pub fn new(store: Arc<dyn Store>, proxy: Arc<dyn ReverseProxy>, options: DocumentOptions) -> Self {
        Self {
            store,
            proxy,
            options,
            last_pushed: Mutex::new(None),
        }
    }

    /// Build the document from current state
    pub async fn document(&self) -> Result<CaddyConfig, EngineError> {
        let domains = self.store.list_domains().await?;
        let services = self.store.list_services().await?;

        let mut upstreams = HashMap::new();
        for service in services {
            let Some(deployment_id) = service.current_deployment_id.as_deref() else {
                continue;
            };
            let ports = self
                .store
                .list_replicas(deployment_id)
                .await?
                .into_iter()
                .filter(|r| r.status == ReplicaStatus::Running)
                .map(|r| r.host_port)
                .collect();
            upstreams.insert(
                service.id.clone(),
                ServiceUpstreams {
                    ports,
                    request_timeout: service.request_timeout,
                },
            );
        }

        Ok(build_document(&self.options, &domains, &upstreams))
    }

    /// Rebuild and push. Returns whether a push happened.
    ///
    /// The document is built while holding the sync lock, so pushes are
    /// totally ordered and never regress to an older state.
    pub async fn sync(&self, reason: &str) -> Result<bool, EngineError> {
        self.push(reason, false).await
    }

    /// Push even when the document is unchanged (the proxy may have restarted)
    pub async fn force_sync(&self, reason: &str) -> Result<bool, EngineError> {
        self.push(reason, true).await
    }

    async fn push(&self, reason: &str, force: bool) -> Result<bool, EngineError> {
        let mut last_pushed = self.last_pushed.lock().await;

        let document = self.document().await?;
        let hash = sha256_hash(&serde_json::to_vec(&document)?);

        if !force && last_pushed.as_deref() == Some(hash.as_str()) {
            debug!("Proxy config unchanged ({}), skipping push", reason);
            return Ok(false);
        }

        self.proxy.load(&document).await?;
        info!(
            "Pushed proxy config ({}): {} route(s)",
            reason,
            document.routes().len()
        );
        *last_pushed = Some(hash);
        Ok(true)
    }
}
