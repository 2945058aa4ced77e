//! Deployment orchestrator
//!
//! The entry point for every exposed operation. Owns the per-service busy map
//! that admits at most one in-flight deployment per service, spawns one
//! runner task per deployment, and keeps the domain table and the proxy
//! document in step.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::deploy::{
    BuildExecutor, CancelFlag, ControllerOptions, DeploySource, DeploymentEvent, DeploymentFsm,
    DeploymentRunner, HealthGate, HealthProbe, ReplicaSetController, RollbackCoordinator,
    SourceFetcher, StageTimeouts,
};
use crate::dns::DnsProvider;
use crate::errors::EngineError;
use crate::models::{
    validate_service, Deployment, DeploymentStatus, DeploymentTrigger, Domain, DomainType,
    NewDomain, NewService, Replica, ReplicaStatus, Service, ServiceSettingsUpdate, SslStatus,
};
use crate::proxy::{DocumentOptions, ProxySynchronizer, ReverseProxy};
use crate::runtime::{ContainerRuntime, PortAllocator};
use crate::store::Store;
use crate::stream::{
    follow_runtime_logs, FollowOptions, FollowTarget, LogHub, LogSubscription,
    RuntimeLogSubscription,
};
use crate::utils::slugify;

const INTERRUPTED_MESSAGE: &str = "interrupted by engine restart";

const REDIRECT_CODES: [u16; 4] = [301, 302, 307, 308];

/// External systems the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub probe: Arc<dyn HealthProbe>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub dns: Arc<dyn DnsProvider>,
}

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Persistent checkouts, one directory per service
    pub repos_dir: PathBuf,

    /// Inclusive host port range for replicas
    pub port_range: (u16, u16),

    /// Skip ports a foreign process already listens on
    pub probe_ports: bool,

    pub controller: ControllerOptions,

    /// Interval between health probe attempts
    pub health_poll_interval: Duration,

    pub timeouts: StageTimeouts,

    pub document: DocumentOptions,

    pub follow: FollowOptions,

    /// Parent zone of generated system domains
    pub system_domain_suffix: Option<String>,

    /// Public address custom domains must resolve to
    pub server_ip: Option<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            repos_dir: std::env::temp_dir().join("frost-repos"),
            port_range: (10000, 20000),
            probe_ports: true,
            controller: ControllerOptions::default(),
            health_poll_interval: Duration::from_secs(1),
            timeouts: StageTimeouts::default(),
            document: DocumentOptions::default(),
            follow: FollowOptions::default(),
            system_domain_suffix: None,
            server_ip: None,
        }
    }
}

/// What `recover` found at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Deployments marked failed because the engine stopped mid-flight
    pub interrupted: usize,

    /// Ports of live replicas reserved in the allocator
    pub reserved_ports: usize,

    /// Superseded replicas whose drain was restarted
    pub drains_resumed: usize,
}

struct InFlight {
    deployment_id: String,
    cancel: CancelFlag,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    dns: Arc<dyn DnsProvider>,
    logs: Arc<LogHub>,
    ports: Arc<PortAllocator>,
    proxy: Arc<ProxySynchronizer>,
    controller: Arc<ReplicaSetController>,
    runner: Arc<DeploymentRunner>,
    rollback: RollbackCoordinator,
    options: OrchestratorOptions,

    /// In-flight deployment per service id
    busy: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl Orchestrator {
    /// Wire the pipeline components around the given collaborators
    pub fn new(collaborators: Collaborators, options: OrchestratorOptions) -> Self {
        let Collaborators {
            store,
            runtime,
            fetcher,
            probe,
            proxy,
            dns,
        } = collaborators;

        let logs = Arc::new(LogHub::new());
        let ports = Arc::new(PortAllocator::new(
            options.port_range.0,
            options.port_range.1,
            options.probe_ports,
        ));
        let proxy = Arc::new(ProxySynchronizer::new(
            store.clone(),
            proxy,
            options.document.clone(),
        ));
        let controller = Arc::new(ReplicaSetController::new(
            runtime.clone(),
            store.clone(),
            ports.clone(),
            HealthGate::new(probe, options.health_poll_interval),
            proxy.clone(),
            options.controller.clone(),
        ));
        let builder = Arc::new(BuildExecutor::new(
            runtime.clone(),
            fetcher,
            options.repos_dir.clone(),
        ));
        let runner = Arc::new(DeploymentRunner::new(
            store.clone(),
            runtime.clone(),
            builder,
            controller.clone(),
            logs.clone(),
            options.timeouts.clone(),
        ));
        let rollback = RollbackCoordinator::new(store.clone(), runtime.clone());

        Self {
            store,
            runtime,
            dns,
            logs,
            ports,
            proxy,
            controller,
            runner,
            rollback,
            options,
            busy: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn proxy(&self) -> Arc<ProxySynchronizer> {
        self.proxy.clone()
    }

    pub fn ports(&self) -> Arc<PortAllocator> {
        self.ports.clone()
    }

    async fn service(&self, service_id: &str) -> Result<Service, EngineError> {
        self.store
            .get_service(service_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("service {}", service_id)))
    }

    async fn deployment(&self, deployment_id: &str) -> Result<Deployment, EngineError> {
        self.store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("deployment {}", deployment_id)))
    }

    async fn resync(&self, reason: &str) {
        if let Err(e) = self.proxy.sync(reason).await {
            warn!("Proxy resync after {} failed: {}", reason, e);
        }
    }

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Start a deployment of the service's configured source
    pub async fn create_deployment(&self, service_id: &str) -> Result<Deployment, EngineError> {
        let service = self.service(service_id).await?;
        validate_service(&service)?;
        self.start(service, DeploymentTrigger::Deploy, DeploySource::Service, None)
            .await
    }

    /// Redeploy the image snapshot of an earlier deployment
    pub async fn rollback(&self, deployment_id: &str) -> Result<Deployment, EngineError> {
        let plan = self.rollback.plan(deployment_id).await?;
        let trigger = DeploymentTrigger::Rollback {
            from_deployment_id: plan.target.id.clone(),
        };
        self.start(
            plan.service,
            trigger,
            DeploySource::Snapshot(plan.image),
            Some(&plan.target),
        )
        .await
    }

    /// Admit and spawn a deployment. The busy check and the row insert happen
    /// under one lock, so a concurrent request sees either the entry or the row.
    async fn start(
        &self,
        service: Service,
        trigger: DeploymentTrigger,
        source: DeploySource,
        revision_of: Option<&Deployment>,
    ) -> Result<Deployment, EngineError> {
        let mut busy = self.busy.lock().await;

        if let Some(in_flight) = busy.get(&service.id) {
            return Err(EngineError::Conflict(format!(
                "deployment {} of {} is still in progress",
                in_flight.deployment_id, service.name
            )));
        }
        if let Some(active) = self
            .store
            .list_deployments(&service.id)
            .await?
            .into_iter()
            .find(|d| d.status.is_in_flight())
        {
            return Err(EngineError::Conflict(format!(
                "deployment {} of {} is still {}",
                active.id, service.name, active.status
            )));
        }

        let mut deployment = Deployment::new(&service.id, trigger);
        if let Some(target) = revision_of {
            deployment.commit_sha = target.commit_sha.clone();
            deployment.commit_message = target.commit_message.clone();
        }
        self.store.put_deployment(&deployment).await?;
        self.logs.open(&deployment.id);

        let cancel = CancelFlag::new();
        busy.insert(
            service.id.clone(),
            InFlight {
                deployment_id: deployment.id.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(busy);

        info!(
            "Deployment {} of {} admitted ({:?})",
            deployment.id, service.name, deployment.trigger
        );

        let runner = self.runner.clone();
        let store = self.store.clone();
        let logs = self.logs.clone();
        let busy = self.busy.clone();
        let service_id = service.id.clone();
        let deployment_id = deployment.id.clone();
        let task = tokio::spawn({
            let deployment = deployment.clone();
            async move { runner.run(service, deployment, source, cancel).await }
        });

        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Deployment task {} ended abnormally: {}", deployment_id, e);
                fail_abandoned(store.as_ref(), &deployment_id, &e.to_string()).await;
                logs.close(&deployment_id);
            }
            busy.lock().await.remove(&service_id);
            debug!("Service {} is idle", service_id);
        });

        Ok(deployment)
    }

    /// Request cooperative cancellation of an in-flight deployment
    pub async fn cancel_deployment(&self, deployment_id: &str) -> Result<Deployment, EngineError> {
        let deployment = self.deployment(deployment_id).await?;
        if !deployment.status.is_in_flight() {
            return Err(EngineError::Validation(format!(
                "deployment {} is {} and cannot be cancelled",
                deployment_id, deployment.status
            )));
        }

        let busy = self.busy.lock().await;
        match busy
            .values()
            .find(|in_flight| in_flight.deployment_id == deployment_id)
        {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                info!("Cancellation requested for deployment {}", deployment_id);
                Ok(deployment)
            }
            None => Err(EngineError::Validation(format!(
                "deployment {} has no running pipeline",
                deployment_id
            ))),
        }
    }

    /// Take a running deployment out of service
    pub async fn stop_deployment(&self, deployment_id: &str) -> Result<Deployment, EngineError> {
        let mut deployment = self.deployment(deployment_id).await?;
        if deployment.status != DeploymentStatus::Running {
            return Err(EngineError::Validation(format!(
                "deployment {} is {}; only running deployments can be stopped",
                deployment_id, deployment.status
            )));
        }

        let service = self.service(&deployment.service_id).await?;
        if self.busy.lock().await.contains_key(&service.id) {
            return Err(EngineError::Conflict(format!(
                "{} has a deployment in progress",
                service.name
            )));
        }

        let expected = deployment_id.to_string();
        let (_, service) = self
            .store
            .update_service(
                &service.id,
                Box::new(move |service| {
                    if service.current_deployment_id.as_deref() != Some(expected.as_str()) {
                        return Err(EngineError::Validation(format!(
                            "deployment {} is not the current deployment of {}",
                            expected, service.name
                        )));
                    }
                    service.current_deployment_id = None;
                    Ok(())
                }),
            )
            .await?;
        if let Err(e) = self.proxy.sync("stop").await {
            let restored = deployment_id.to_string();
            self.store
                .update_service(
                    &service.id,
                    Box::new(move |service| {
                        // Only restore an unclaimed pointer
                        if service.current_deployment_id.is_none() {
                            service.current_deployment_id = Some(restored);
                        }
                        Ok(())
                    }),
                )
                .await?;
            return Err(e);
        }

        let replicas: Vec<Replica> = self
            .store
            .list_replicas(deployment_id)
            .await?
            .into_iter()
            .filter(Replica::is_running)
            .collect();
        info!(
            "Stopping deployment {}: draining {} replica(s)",
            deployment_id,
            replicas.len()
        );
        self.controller.drain(replicas, service.drain_timeout);

        let status = DeploymentFsm::from_status(deployment.status)
            .process(DeploymentEvent::Stop)
            .map_err(EngineError::Internal)?;
        deployment.status = status;
        deployment.finished_at = Some(Utc::now());
        deployment.build_log.push_str(&format!("==> {}\n", status));
        self.store.put_deployment(&deployment).await?;
        Ok(deployment)
    }

    /// Whether a deployment task of the service is still alive
    pub async fn is_deploying(&self, service_id: &str) -> bool {
        self.busy.lock().await.contains_key(service_id)
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment, EngineError> {
        self.deployment(deployment_id).await
    }

    /// Deployments of a service, newest first
    pub async fn list_deployments(&self, service_id: &str) -> Result<Vec<Deployment>, EngineError> {
        self.service(service_id).await?;
        self.store.list_deployments(service_id).await
    }

    pub async fn get_replicas(&self, deployment_id: &str) -> Result<Vec<Replica>, EngineError> {
        self.deployment(deployment_id).await?;
        self.store.list_replicas(deployment_id).await
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Build log so far, then live lines until the deployment settles
    pub async fn subscribe_build_logs(
        &self,
        deployment_id: &str,
    ) -> Result<LogSubscription, EngineError> {
        if let Some(log) = self.logs.get(deployment_id) {
            return Ok(log.subscribe());
        }
        let deployment = self.deployment(deployment_id).await?;
        Ok(LogSubscription::finished(&deployment.build_log))
    }

    /// Follow the output of one replica, or of all running replicas
    pub async fn subscribe_runtime_logs(
        &self,
        deployment_id: &str,
        replica_index: Option<u32>,
    ) -> Result<RuntimeLogSubscription, EngineError> {
        let running: Vec<Replica> = self
            .get_replicas(deployment_id)
            .await?
            .into_iter()
            .filter(|r| r.is_running() && r.container_id.is_some())
            .collect();
        if running.is_empty() {
            return Err(EngineError::Validation(format!(
                "deployment {} has no running replicas",
                deployment_id
            )));
        }

        let targets: Vec<FollowTarget> = running
            .into_iter()
            .filter(|r| replica_index.map_or(true, |index| r.replica_index == index))
            .filter_map(|r| {
                r.container_id.map(|container_id| FollowTarget {
                    replica_index: r.replica_index,
                    container_id,
                })
            })
            .collect();
        if targets.is_empty() {
            return Err(EngineError::NotFound(format!(
                "replica {} of deployment {}",
                replica_index.unwrap_or_default(),
                deployment_id
            )));
        }

        Ok(follow_runtime_logs(
            self.runtime.clone(),
            targets,
            self.options.follow.clone(),
        ))
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Persist a new service along with its system domain
    pub async fn create_service(&self, input: NewService) -> Result<Service, EngineError> {
        let project_slug = slugify(&input.project_name, 30);
        let service = Service::from_new(input);
        validate_service(&service)?;
        self.store.put_service(&service).await?;
        info!("Created service {} ({})", service.name, service.id);

        if let Some(suffix) = self.options.system_domain_suffix.as_deref() {
            let hostname = format!("{}-{}.{}", slugify(&service.name, 30), project_slug, suffix);
            let mut domain = Domain::new(Some(&service.id), &hostname, DomainType::Proxy);
            domain.is_system = true;
            domain.dns_verified = true;
            self.point_dns(&domain.domain).await;
            self.store.put_domain(&domain).await?;
            debug!("System domain {} assigned to {}", domain.domain, service.name);
        }

        Ok(service)
    }

    /// Validate and store new settings; running replicas are unaffected
    pub async fn update_service_settings(
        &self,
        service_id: &str,
        update: ServiceSettingsUpdate,
    ) -> Result<Service, EngineError> {
        let (_, service) = self
            .store
            .update_service(
                service_id,
                Box::new(move |service| {
                    service.apply(update);
                    validate_service(service)
                }),
            )
            .await?;
        info!("Updated settings of {}", service.name);
        Ok(service)
    }

    /// Image names the cleanup job must keep
    pub async fn referenced_images(&self) -> Result<Vec<String>, EngineError> {
        let mut images = BTreeSet::new();
        for service in self.store.list_services().await? {
            let Some(current) = service.current_deployment_id.as_deref() else {
                continue;
            };
            if let Some(image) = self
                .store
                .get_deployment(current)
                .await?
                .and_then(|d| d.image_name)
            {
                images.insert(image);
            }
        }
        for deployment in self.store.list_all_deployments().await? {
            if deployment.status.is_in_flight() {
                if let Some(image) = deployment.image_name {
                    images.insert(image);
                }
            }
        }
        Ok(images.into_iter().collect())
    }

    // ------------------------------------------------------------------
    // Domains
    // ------------------------------------------------------------------

    async fn point_dns(&self, hostname: &str) {
        if let Some(ip) = self.options.server_ip.as_deref() {
            if let Err(e) = self.dns.create_or_update_a_record(hostname, ip).await {
                warn!("Failed to create A record {} -> {}: {}", hostname, ip, e);
            }
        }
    }

    pub async fn add_domain(&self, input: NewDomain) -> Result<Domain, EngineError> {
        let mut domain = Domain::new(input.service_id.as_deref(), &input.domain, input.domain_type);
        if !crate::models::domain::is_valid_hostname(&domain.domain) {
            return Err(EngineError::Validation(format!(
                "{} is not a valid hostname",
                input.domain
            )));
        }

        match (domain.domain_type, domain.service_id.as_deref()) {
            (DomainType::FrostAdmin, _) => domain.service_id = None,
            (_, Some(service_id)) => {
                self.service(service_id).await?;
            }
            (_, None) => {
                return Err(EngineError::Validation(format!(
                    "{} domains need a service",
                    domain.domain_type
                )))
            }
        }

        if domain.domain_type == DomainType::Redirect {
            let target = input
                .redirect_target
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    EngineError::Validation("redirect domains need a target".to_string())
                })?;
            let code = input.redirect_code.unwrap_or(Domain::DEFAULT_REDIRECT_CODE);
            if !REDIRECT_CODES.contains(&code) {
                return Err(EngineError::Validation(format!(
                    "redirect code {} is not one of {:?}",
                    code, REDIRECT_CODES
                )));
            }
            domain.redirect_target = Some(target);
            domain.redirect_code = Some(code);
        }
        domain.request_timeout = input.request_timeout.filter(|t| *t > 0);

        if self
            .store
            .list_domains()
            .await?
            .iter()
            .any(|d| d.domain == domain.domain)
        {
            return Err(EngineError::Conflict(format!(
                "{} is already in use",
                domain.domain
            )));
        }

        self.point_dns(&domain.domain).await;
        self.store.put_domain(&domain).await?;
        info!("Added {} domain {}", domain.domain_type, domain.domain);
        self.resync("domain added").await;
        Ok(domain)
    }

    /// Check the hostname resolves to this server and start routing it
    pub async fn verify_domain(&self, domain_id: &str) -> Result<Domain, EngineError> {
        let mut domain = self
            .store
            .get_domain(domain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("domain {}", domain_id)))?;

        let addresses = self.dns.resolve(&domain.domain).await;
        let verified = match self.options.server_ip.as_deref() {
            Some(ip) => {
                let expected: IpAddr = ip
                    .parse()
                    .map_err(|_| EngineError::ConfigError(format!("invalid server ip {}", ip)))?;
                addresses.contains(&expected)
            }
            None => !addresses.is_empty(),
        };
        if !verified {
            return Err(EngineError::Validation(format!(
                "{} does not resolve to {}",
                domain.domain,
                self.options.server_ip.as_deref().unwrap_or("any address")
            )));
        }

        domain.dns_verified = true;
        self.store.put_domain(&domain).await?;
        self.proxy.sync("domain verified").await?;

        domain.ssl_status = SslStatus::Active;
        self.store.put_domain(&domain).await?;
        info!("Domain {} verified", domain.domain);
        Ok(domain)
    }

    pub async fn remove_domain(&self, domain_id: &str) -> Result<Domain, EngineError> {
        let domain = self
            .store
            .get_domain(domain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("domain {}", domain_id)))?;

        if domain.is_system && domain.dns_verified {
            let other_verified = self
                .store
                .list_domains()
                .await?
                .iter()
                .filter(|d| d.id != domain.id && d.dns_verified)
                .any(|d| d.service_id.is_some() && d.service_id == domain.service_id);
            if !other_verified {
                return Err(EngineError::Validation(format!(
                    "{} is the only verified domain of its service",
                    domain.domain
                )));
            }
        }

        self.store.delete_domain(domain_id).await?;
        info!("Removed domain {}", domain.domain);
        self.resync("domain removed").await;
        Ok(domain)
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Reconcile persisted state after a restart. The proxy push is left to
    /// the proxy worker.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let services: HashMap<String, Service> = self
            .store
            .list_services()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        for mut deployment in self.store.list_all_deployments().await? {
            if deployment.status.is_in_flight() {
                let mut fsm = DeploymentFsm::from_status(deployment.status);
                let status = fsm
                    .process(DeploymentEvent::Fail(INTERRUPTED_MESSAGE.to_string()))
                    .map_err(EngineError::Internal)?;
                deployment.status = status;
                deployment.error_message = Some(INTERRUPTED_MESSAGE.to_string());
                deployment.finished_at = Some(Utc::now());
                deployment
                    .build_log
                    .push_str(&format!("Deployment failed: {}\n==> {}\n", INTERRUPTED_MESSAGE, status));
                self.store.put_deployment(&deployment).await?;
                self.controller.abort_deployment(&deployment.id).await?;
                report.interrupted += 1;
                warn!("Deployment {} was interrupted by a restart", deployment.id);
            }

            let running: Vec<Replica> = self
                .store
                .list_replicas(&deployment.id)
                .await?
                .into_iter()
                .filter(|r| r.status == ReplicaStatus::Running)
                .collect();
            if running.is_empty() {
                continue;
            }

            for replica in &running {
                self.ports.reserve(replica.host_port);
            }
            report.reserved_ports += running.len();

            let service = services.get(&deployment.service_id);
            let is_current = service
                .and_then(|s| s.current_deployment_id.as_deref())
                == Some(deployment.id.as_str());
            if !is_current {
                let grace = service.map_or(
                    crate::models::service::DEFAULT_DRAIN_TIMEOUT_SECS,
                    |s| s.drain_timeout,
                );
                report.drains_resumed += running.len();
                self.controller.drain(running, grace);
            }
        }

        info!(
            "Recovery: {} interrupted deployment(s), {} port(s) reserved, {} drain(s) resumed",
            report.interrupted, report.reserved_ports, report.drains_resumed
        );
        Ok(report)
    }
}

/// Record a deployment whose task died before reaching a final state
async fn fail_abandoned(store: &dyn Store, deployment_id: &str, reason: &str) {
    match store.get_deployment(deployment_id).await {
        Ok(Some(mut deployment)) if deployment.status.is_in_flight() => {
            deployment.status = DeploymentStatus::Failed;
            deployment.error_message = Some(format!("deployment task aborted: {}", reason));
            deployment.finished_at = Some(Utc::now());
            if let Err(e) = store.put_deployment(&deployment).await {
                error!("Failed to record abandoned deployment {}: {}", deployment_id, e);
            }
        }
        Ok(_) => {}
        Err(e) => error!("Failed to load deployment {}: {}", deployment_id, e),
    }
}
