//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::{GitCli, HttpProbe};
use crate::dns::NoopDns;
use crate::errors::EngineError;
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::proxy::CaddyAdmin;
use crate::runtime::DockerCli;
use crate::store::MemoryStore;

/// Main application state
pub struct AppState {
    /// Entry point for every deployment, service and domain operation
    pub orchestrator: Arc<Orchestrator>,

    /// Snapshot-backed persistence
    pub store: Arc<MemoryStore>,
}

impl AppState {
    /// Initialize application state and reconcile what a previous run left behind
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        options.layout.setup().await?;
        let store = Arc::new(MemoryStore::open(options.layout.state_file()).await?);

        let docker = DockerCli::new(options.collaborators.docker_bin.clone());
        if let Err(e) = docker.ensure_network(&options.collaborators.network).await {
            warn!(
                "Failed to ensure docker network {}: {}",
                options.collaborators.network, e
            );
        }

        let collaborators = Collaborators {
            store: store.clone(),
            runtime: Arc::new(docker),
            fetcher: Arc::new(GitCli::new(options.collaborators.git_bin.clone())),
            probe: Arc::new(HttpProbe::new(options.collaborators.probe_request_timeout)),
            proxy: Arc::new(CaddyAdmin::new(&options.collaborators.proxy_admin_url)?),
            dns: Arc::new(NoopDns),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            collaborators,
            options.orchestrator.clone(),
        ));
        orchestrator.recover().await?;

        Ok(Self {
            orchestrator,
            store,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down application state...");
        self.store.flush().await
    }
}
