//! Replica set controller
//!
//! Rollout of a deployment's replicas: start N containers in parallel, health
//! gate all of them behind a join barrier, switch routing with a single proxy
//! push, then drain the superseded replicas after their grace period.
//! Volume-backed services take a stop-old/start-new swap instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::deploy::health::{HealthGate, ProbeTarget};
use crate::errors::EngineError;
use crate::models::{Deployment, Replica, ReplicaStatus, Service};
use crate::proxy::ProxySynchronizer;
use crate::runtime::{ContainerRuntime, PortAllocator, RunSpec};
use crate::store::Store;
use crate::stream::BuildLog;

/// Grace given to never-routed containers of an aborted rollout
const ABORT_GRACE_SECS: u64 = 5;

/// Extra time allowed past the drain grace before giving up on observing exit
const DRAIN_OBSERVE_SLACK: Duration = Duration::from_secs(30);

/// Controller options
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Docker network the replicas join
    pub network: Option<String>,

    /// Interval between `inspect` calls while waiting for a stop to land
    pub stop_poll_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            network: None,
            stop_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Result of a successful rollout
pub struct RolloutOutcome {
    /// New replicas, all running and routed
    pub replicas: Vec<Replica>,

    /// Drain tasks of the superseded replicas
    pub drains: Vec<JoinHandle<()>>,
}

/// Healthy replicas waiting for the routing switch
pub struct StagedRollout {
    service: Service,
    replicas: Vec<Replica>,

    /// Live replicas of the previous deployment
    old: Vec<Replica>,
}

/// Runtime handles shared by rollout and drain tasks
#[derive(Clone)]
struct Drainer {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    ports: Arc<PortAllocator>,
    poll_interval: Duration,
}

impl Drainer {
    /// Wait until a stopped container is observed not running, or the deadline passes
    async fn wait_stopped(&self, container_id: &str, deadline: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.runtime.inspect(container_id).await {
                Ok(state) if !state.running => return true,
                Ok(_) => {}
                Err(e) => warn!("Failed to inspect {} while draining: {}", container_id, e),
            }
            if started.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop a replica with a grace period, observe its exit, free its port
    async fn drain(&self, mut replica: Replica, grace_secs: u64) {
        if let Some(container_id) = replica.container_id.clone() {
            match self.runtime.stop(&container_id, grace_secs).await {
                Ok(()) => {
                    let deadline = Duration::from_secs(grace_secs) + DRAIN_OBSERVE_SLACK;
                    if !self.wait_stopped(&container_id, deadline).await {
                        warn!(
                            "Container {} still running {:?} after stop",
                            container_id, deadline
                        );
                    }
                }
                Err(e) => error!("Failed to stop container {}: {}", container_id, e),
            }
        }

        self.ports.release(replica.host_port);
        replica.status = ReplicaStatus::Stopped;
        if let Err(e) = self.store.put_replica(&replica).await {
            error!("Failed to record stopped replica {}: {}", replica.id, e);
        }
        info!(
            "Drained replica {} of deployment {}",
            replica.replica_index, replica.deployment_id
        );
    }
}

pub struct ReplicaSetController {
    drainer: Drainer,
    gate: HealthGate,
    proxy: Arc<ProxySynchronizer>,
    options: ControllerOptions,
}

impl ReplicaSetController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        ports: Arc<PortAllocator>,
        gate: HealthGate,
        proxy: Arc<ProxySynchronizer>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            drainer: Drainer {
                runtime,
                store,
                ports,
                poll_interval: options.stop_poll_interval,
            },
            gate,
            proxy,
            options,
        }
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.drainer.runtime
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.drainer.store
    }

    fn run_spec(&self, service: &Service, deployment: &Deployment, image: &str, replica: &Replica) -> RunSpec {
        let mut env = service.env.clone();
        env.entry("PORT".to_string())
            .or_insert_with(|| service.container_port.to_string());

        let mut labels = BTreeMap::new();
        labels.insert("frost.managed".to_string(), "true".to_string());
        labels.insert("frost.service_id".to_string(), service.id.clone());
        labels.insert("frost.deployment_id".to_string(), deployment.id.clone());
        labels.insert(
            "frost.replica_index".to_string(),
            replica.replica_index.to_string(),
        );

        RunSpec {
            name: format!(
                "{}-{}-{}",
                service.container_prefix(),
                deployment.short_id(),
                replica.replica_index
            ),
            image: image.to_string(),
            host_port: replica.host_port,
            container_port: service.container_port,
            env,
            volumes: service.volumes.clone(),
            limits: service.limits.clone(),
            network: self.options.network.clone(),
            labels,
        }
    }

    /// Running replicas of the service's current deployment
    async fn live_replicas(&self, service: &Service) -> Result<Vec<Replica>, EngineError> {
        match service.current_deployment_id.as_deref() {
            Some(current) => Ok(self
                .store()
                .list_replicas(current)
                .await?
                .into_iter()
                .filter(|r| r.is_running())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Allocate ports and record pending replicas. Nothing stays allocated on error.
    async fn create_replicas(
        &self,
        deployment: &Deployment,
        count: u32,
    ) -> Result<Vec<Replica>, EngineError> {
        let ports = self.drainer.ports.allocate(count as usize)?;
        let mut replicas = Vec::with_capacity(ports.len());
        for (index, port) in ports.iter().enumerate() {
            let replica = Replica::new(&deployment.id, index as u32, *port);
            if let Err(e) = self.store().put_replica(&replica).await {
                for port in &ports[index..] {
                    self.drainer.ports.release(*port);
                }
                self.abort(&mut replicas).await;
                return Err(e);
            }
            replicas.push(replica);
        }
        Ok(replicas)
    }

    /// Start every replica concurrently, recording container ids as they come back
    async fn start_replicas(
        &self,
        service: &Service,
        deployment: &Deployment,
        image: &str,
        replicas: &mut [Replica],
        log: &BuildLog,
    ) -> Result<(), EngineError> {
        let specs: Vec<RunSpec> = replicas
            .iter()
            .map(|r| self.run_spec(service, deployment, image, r))
            .collect();
        let results = join_all(specs.iter().map(|spec| self.runtime().run(spec))).await;

        let mut first_error = None;
        for (replica, result) in replicas.iter_mut().zip(results) {
            match result {
                Ok(container_id) => {
                    log.append(format!(
                        "Replica {} started on port {} ({})",
                        replica.replica_index,
                        replica.host_port,
                        container_id.chars().take(12).collect::<String>()
                    ));
                    replica.container_id = Some(container_id);
                    self.store().put_replica(replica).await?;
                }
                Err(e) => {
                    log.append(format!("Replica {} failed to start: {}", replica.replica_index, e));
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Health gate every replica; all checks settle before the aggregate is decided
    async fn gate_replicas(&self, service: &Service, replicas: &[Replica], log: &BuildLog) -> bool {
        let timeout = Duration::from_secs(service.health_check_timeout);
        let path = service.health_check_path.as_deref();

        log.append(format!(
            "Waiting for {} replica(s) to pass {} (timeout {}s)",
            replicas.len(),
            path.unwrap_or("a TCP connect check"),
            service.health_check_timeout
        ));

        let targets: Vec<ProbeTarget> = replicas
            .iter()
            .map(|r| ProbeTarget::HostPort(r.host_port))
            .collect();
        let verdicts = join_all(
            targets
                .iter()
                .map(|target| self.gate.wait_healthy(target, path, timeout)),
        )
        .await;

        let mut all_healthy = true;
        for (replica, verdict) in replicas.iter().zip(verdicts) {
            if verdict.healthy {
                log.append(format!(
                    "Replica {} healthy after {} attempt(s)",
                    replica.replica_index, verdict.attempts
                ));
            } else {
                all_healthy = false;
                log.append(format!(
                    "Replica {} failed health check after {:.1}s",
                    replica.replica_index,
                    verdict.elapsed.as_secs_f64()
                ));
            }
        }
        all_healthy
    }

    /// Best-effort teardown of never-routed replicas. Errors are logged only.
    async fn abort(&self, replicas: &mut [Replica]) {
        for replica in replicas.iter_mut() {
            if let Some(container_id) = &replica.container_id {
                if let Err(e) = self.runtime().stop(container_id, ABORT_GRACE_SECS).await {
                    warn!("Failed to stop aborted replica {}: {}", container_id, e);
                }
            }
            self.drainer.ports.release(replica.host_port);
            replica.status = ReplicaStatus::Failed;
            if let Err(e) = self.store().put_replica(replica).await {
                warn!("Failed to record aborted replica {}: {}", replica.id, e);
            }
        }
    }

    /// Tear down whatever a timed-out or dropped rollout left pending
    pub async fn abort_deployment(&self, deployment_id: &str) -> Result<(), EngineError> {
        let mut pending: Vec<Replica> = self
            .store()
            .list_replicas(deployment_id)
            .await?
            .into_iter()
            .filter(|r| r.status == ReplicaStatus::Pending)
            .collect();
        if !pending.is_empty() {
            info!(
                "Aborting {} pending replica(s) of deployment {}",
                pending.len(),
                deployment_id
            );
            self.abort(&mut pending).await;
        }
        Ok(())
    }

    /// Mark replicas running and point the service at the deployment
    async fn switch(
        &self,
        service_id: &str,
        deployment: &Deployment,
        replicas: &mut [Replica],
    ) -> Result<Option<String>, EngineError> {
        for replica in replicas.iter_mut() {
            replica.status = ReplicaStatus::Running;
            self.store().put_replica(replica).await?;
        }

        let deployment_id = deployment.id.clone();
        let (before, _) = self
            .store()
            .update_service(
                service_id,
                Box::new(move |service| {
                    service.current_deployment_id = Some(deployment_id);
                    Ok(())
                }),
            )
            .await?;
        Ok(before.current_deployment_id)
    }

    /// Undo a switch whose proxy push failed
    async fn revert_switch(
        &self,
        service_id: &str,
        deployment_id: &str,
        previous: Option<String>,
        replicas: &mut [Replica],
    ) {
        let switched = deployment_id.to_string();
        let revert = self.store().update_service(
            service_id,
            Box::new(move |service| {
                if service.current_deployment_id.as_deref() == Some(switched.as_str()) {
                    service.current_deployment_id = previous;
                }
                Ok(())
            }),
        );
        if let Err(e) = revert.await {
            error!("Failed to revert current deployment of {}: {}", service_id, e);
        }
        self.abort(replicas).await;
    }

    /// Issue drain stops for replicas that no longer receive traffic
    pub fn drain(&self, replicas: Vec<Replica>, grace_secs: u64) -> Vec<JoinHandle<()>> {
        replicas
            .into_iter()
            .map(|replica| {
                let drainer = self.drainer.clone();
                tokio::spawn(async move { drainer.drain(replica, grace_secs).await })
            })
            .collect()
    }

    /// Start and health gate the deployment's replicas without touching
    /// routing. On error every new replica is torn down.
    pub async fn stage(
        &self,
        service: &Service,
        deployment: &Deployment,
        image: &str,
        log: &BuildLog,
    ) -> Result<StagedRollout, EngineError> {
        // Fresh read: the pointer may have moved since the deployment started.
        let service = self
            .store()
            .get_service(&service.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("service {}", service.id)))?;

        if service.has_volumes() && service.replica_count > 1 {
            return Err(EngineError::Validation(
                "services with volumes are limited to one replica".to_string(),
            ));
        }

        let count = if service.has_volumes() {
            1
        } else {
            service.replica_count.max(1)
        };
        let old = self.live_replicas(&service).await?;
        log.append(format!("Starting {} replica(s) of {}", count, image));

        let mut replicas = self.create_replicas(deployment, count).await?;
        match self
            .bring_up(&service, deployment, image, &mut replicas, &old, log)
            .await
        {
            Ok(()) => {
                // A volume swap has already stopped the previous replica
                let old = if service.has_volumes() { Vec::new() } else { old };
                Ok(StagedRollout {
                    service,
                    replicas,
                    old,
                })
            }
            Err(e) => {
                self.abort(&mut replicas).await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        service: &Service,
        deployment: &Deployment,
        image: &str,
        replicas: &mut [Replica],
        old: &[Replica],
        log: &BuildLog,
    ) -> Result<(), EngineError> {
        if service.has_volumes() && !old.is_empty() {
            self.stop_previous(service, old, log).await?;
        }

        self.start_replicas(service, deployment, image, replicas, log)
            .await?;

        if !self.gate_replicas(service, replicas, log).await {
            return Err(EngineError::RolloutFailure(format!(
                "health check failed within {}s; {} new replica(s) stopped, previous deployment left serving",
                service.health_check_timeout,
                replicas.len()
            )));
        }
        Ok(())
    }

    /// Single-writer swap for volume-backed services: the old replica is gone
    /// before the new one starts
    async fn stop_previous(
        &self,
        service: &Service,
        old: &[Replica],
        log: &BuildLog,
    ) -> Result<(), EngineError> {
        log.append(format!(
            "Stopping previous replica before starting the new one ({}s grace)",
            service.drain_timeout
        ));
        for replica in old {
            if let Some(container_id) = &replica.container_id {
                self.runtime().stop(container_id, service.drain_timeout).await?;
                let deadline = Duration::from_secs(service.drain_timeout) + DRAIN_OBSERVE_SLACK;
                if !self.drainer.wait_stopped(container_id, deadline).await {
                    warn!("Previous container {} did not stop in time", container_id);
                }
            }
            self.drainer.ports.release(replica.host_port);
            let mut stopped = replica.clone();
            stopped.status = ReplicaStatus::Stopped;
            self.store().put_replica(&stopped).await?;
        }
        // Route nothing rather than a stopped container.
        if let Err(e) = self.proxy.sync("volume swap").await {
            warn!("Proxy push failed after stopping previous replica: {}", e);
        }
        debug!("Previous replica of {} stopped", service.id);
        Ok(())
    }

    /// Switch routing to staged replicas with a single proxy push, then drain
    /// the superseded ones. Runs to completion once started.
    pub async fn commit(
        &self,
        deployment: &Deployment,
        staged: StagedRollout,
        log: &BuildLog,
    ) -> Result<RolloutOutcome, EngineError> {
        let StagedRollout {
            service,
            mut replicas,
            old,
        } = staged;

        let previous = match self.switch(&service.id, deployment, &mut replicas).await {
            Ok(previous) => previous,
            Err(e) => {
                self.abort(&mut replicas).await;
                return Err(e);
            }
        };
        if let Err(e) = self.proxy.sync("rollout").await {
            error!("Proxy push failed during rollout of {}: {}", deployment.id, e);
            self.revert_switch(&service.id, &deployment.id, previous, &mut replicas)
                .await;
            return Err(e);
        }
        log.append(format!("Traffic switched to {} replica(s)", replicas.len()));

        let drains = if old.is_empty() {
            Vec::new()
        } else {
            log.append(format!(
                "Draining {} previous replica(s) with {}s grace",
                old.len(),
                service.drain_timeout
            ));
            self.drain(old, service.drain_timeout)
        };

        Ok(RolloutOutcome { replicas, drains })
    }
}
