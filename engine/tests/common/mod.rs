//! Fakes shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use frost_engine::deploy::git::FetchMode;
use frost_engine::deploy::{HealthProbe, ProbeTarget, SourceFetcher, SourceRevision};
use frost_engine::dns::DnsProvider;
use frost_engine::errors::EngineError;
use frost_engine::models::{Deployment, DeploymentStatus, NewService, SourceMode};
use frost_engine::orchestrator::{Collaborators, Orchestrator, OrchestratorOptions};
use frost_engine::proxy::{CaddyConfig, ReverseProxy};
use frost_engine::runtime::{
    BuildOutput, BuildRequest, ContainerRuntime, ContainerState, LineSink, LogStreamOptions,
    RunSpec,
};
use frost_engine::store::{MemoryStore, Store};

// ================================ JOURNAL ===================================== //

/// Side effects across the runtime and the proxy, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Build { tag: String, dockerfile: String },
    Pull { image: String },
    Run { container_id: String, image: String, host_port: u16 },
    Stop { container_id: String, grace_secs: u64 },
    ProxyLoad { upstreams: Vec<String> },
}

#[derive(Default)]
pub struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }
}

// ================================ RUNTIME ===================================== //

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub running: bool,
    pub labels: std::collections::BTreeMap<String, String>,
}

impl FakeContainer {
    pub fn replica_index(&self) -> Option<u32> {
        self.labels
            .get("frost.replica_index")
            .and_then(|index| index.parse().ok())
    }
}

#[derive(Default)]
struct RuntimeState {
    next_id: usize,
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    build_fails: bool,
    build_delay: Duration,
    pull_fails: bool,
    run_fails: bool,
    stop_fails: bool,
    log_lines: Vec<String>,
}

pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    journal: Arc<Journal>,
}

impl FakeRuntime {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                log_lines: vec!["listening on :3000".to_string(), "GET / 200".to_string()],
                ..Default::default()
            }),
            journal,
        }
    }

    pub fn add_image(&self, image: &str) {
        self.state.lock().unwrap().images.insert(image.to_string());
    }

    pub fn remove_image(&self, image: &str) {
        self.state.lock().unwrap().images.remove(image);
    }

    pub fn set_build_fails(&self, fails: bool) {
        self.state.lock().unwrap().build_fails = fails;
    }

    pub fn set_build_delay(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = delay;
    }

    pub fn set_pull_fails(&self, fails: bool) {
        self.state.lock().unwrap().pull_fails = fails;
    }

    pub fn set_run_fails(&self, fails: bool) {
        self.state.lock().unwrap().run_fails = fails;
    }

    pub fn set_stop_fails(&self, fails: bool) {
        self.state.lock().unwrap().stop_fails = fails;
    }

    pub fn container(&self, container_id: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(container_id).cloned()
    }

    pub fn container_on_port(&self, port: u16) -> Option<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.host_port == port)
            .find(|c| c.running)
            .cloned()
    }

    pub fn running(&self) -> Vec<FakeContainer> {
        let mut running: Vec<FakeContainer> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.id.cmp(&b.id));
        running
    }

    pub fn run_count(&self) -> usize {
        self.journal
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Run { .. }))
            .count()
    }

    pub fn stops(&self) -> Vec<(String, u64)> {
        self.journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Stop {
                    container_id,
                    grace_secs,
                } => Some((container_id, grace_secs)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build(
        &self,
        request: &BuildRequest,
        sink: &LineSink,
    ) -> Result<BuildOutput, EngineError> {
        self.journal.push(Event::Build {
            tag: request.tag.clone(),
            dockerfile: request.dockerfile.clone(),
        });
        let (fails, delay) = {
            let state = self.state.lock().unwrap();
            (state.build_fails, state.build_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let _ = sink.send("#1 [internal] load build definition".to_string());
        if fails {
            let log = "#1 [internal] load build definition\n#2 ERROR: failed to solve: npm ci exited with 1\n";
            let _ = sink.send("#2 ERROR: failed to solve: npm ci exited with 1".to_string());
            return Ok(BuildOutput {
                success: false,
                log: log.to_string(),
            });
        }

        let _ = sink.send(format!("#2 naming to {}", request.tag));
        self.add_image(&request.tag);
        Ok(BuildOutput {
            success: true,
            log: format!("#1 [internal] load build definition\n#2 naming to {}\n", request.tag),
        })
    }

    async fn pull(&self, image: &str, sink: &LineSink) -> Result<(), EngineError> {
        self.journal.push(Event::Pull {
            image: image.to_string(),
        });
        if self.state.lock().unwrap().pull_fails {
            return Err(EngineError::Infrastructure(format!("pull access denied for {}", image)));
        }
        let _ = sink.send(format!("Status: Downloaded newer image for {}", image));
        self.add_image(image);
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let container_id = {
            let mut state = self.state.lock().unwrap();
            if state.run_fails {
                return Err(EngineError::Infrastructure(format!(
                    "port {} is already allocated",
                    spec.host_port
                )));
            }
            state.next_id += 1;
            let container_id = format!("ctr{:04}", state.next_id);
            state.containers.insert(
                container_id.clone(),
                FakeContainer {
                    id: container_id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    host_port: spec.host_port,
                    running: true,
                    labels: spec.labels.clone(),
                },
            );
            container_id
        };
        self.journal.push(Event::Run {
            container_id: container_id.clone(),
            image: spec.image.clone(),
            host_port: spec.host_port,
        });
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, grace_secs: u64) -> Result<(), EngineError> {
        self.journal.push(Event::Stop {
            container_id: container_id.to_string(),
            grace_secs,
        });
        let mut state = self.state.lock().unwrap();
        if state.stop_fails {
            return Err(EngineError::Infrastructure(format!(
                "cannot stop container {}: permission denied",
                container_id
            )));
        }
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn logs(
        &self,
        container_id: &str,
        options: &LogStreamOptions,
    ) -> Result<BoxStream<'static, String>, EngineError> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(EngineError::Infrastructure(format!(
                "No such container: {}",
                container_id
            )));
        }
        let lines = match options.tail {
            Some(0) => Vec::new(),
            _ => state.log_lines.clone(),
        };
        Ok(stream::iter(lines).boxed())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        Ok(match self.state.lock().unwrap().containers.get(container_id) {
            Some(container) => ContainerState {
                running: container.running,
                exit_code: (!container.running).then_some(0),
            },
            None => ContainerState::gone(),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }
}

// ================================ FETCHER ===================================== //

pub struct FakeFetcher {
    checkouts: Mutex<HashSet<PathBuf>>,
    fails: AtomicBool,
    fetches: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            checkouts: Mutex::new(HashSet::new()),
            fails: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn has_checkout(&self, dir: &Path) -> bool {
        self.checkouts.lock().unwrap().contains(dir)
    }

    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dir: &Path,
        sink: &LineSink,
    ) -> Result<SourceRevision, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fails.load(Ordering::SeqCst) {
            let _ = sink.send(format!("fatal: repository '{}' not found", repo_url));
            return Err(EngineError::BuildFailure(format!(
                "git clone of {} failed",
                repo_url
            )));
        }

        let mode = if self.checkouts.lock().unwrap().insert(dir.to_path_buf()) {
            FetchMode::Cloned
        } else {
            FetchMode::Pulled
        };
        let _ = sink.send(format!("Fetched {} ({})", repo_url, branch));
        Ok(SourceRevision {
            commit_sha: "9f2c1e7d4b3a".to_string(),
            commit_message: "Add health endpoint".to_string(),
            mode,
        })
    }
}

// ================================= PROBE ====================================== //

/// Healthy whenever a running container listens on the port, unless its
/// replica index is scripted to fail
pub struct ScriptedProbe {
    runtime: Arc<FakeRuntime>,
    failing_indices: Mutex<HashSet<u32>>,
    attempts: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            failing_indices: Mutex::new(HashSet::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_replica(&self, index: u32) {
        self.failing_indices.lock().unwrap().insert(index);
    }

    pub fn heal_all(&self) {
        self.failing_indices.lock().unwrap().clear();
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, target: &ProbeTarget, _path: Option<&str>) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let ProbeTarget::HostPort(port) = target else {
            return false;
        };
        match self.runtime.container_on_port(*port) {
            Some(container) => match container.replica_index() {
                Some(index) => !self.failing_indices.lock().unwrap().contains(&index),
                None => true,
            },
            None => false,
        }
    }
}

// ================================= PROXY ====================================== //

pub struct RecordingProxy {
    documents: Mutex<Vec<CaddyConfig>>,
    fails: AtomicBool,
    delay: Mutex<Duration>,
    journal: Arc<Journal>,
}

impl RecordingProxy {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            documents: Mutex::new(Vec::new()),
            fails: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            journal,
        }
    }

    pub fn set_fails(&self, fails: bool) {
        self.fails.store(fails, Ordering::SeqCst);
    }

    /// Slow down every later push
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn documents(&self) -> Vec<CaddyConfig> {
        self.documents.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<CaddyConfig> {
        self.documents.lock().unwrap().last().cloned()
    }

    pub fn pushes(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    /// Upstreams of `host` in the last accepted document
    pub fn upstreams(&self, host: &str) -> Vec<String> {
        self.last()
            .map(|doc| doc.upstreams_for(host))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReverseProxy for RecordingProxy {
    async fn load(&self, document: &CaddyConfig) -> Result<(), EngineError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fails.load(Ordering::SeqCst) {
            return Err(EngineError::Infrastructure(
                "caddy admin: connection refused".to_string(),
            ));
        }
        let upstreams = document
            .routes()
            .iter()
            .flat_map(|route| {
                route
                    .matchers
                    .iter()
                    .flat_map(|m| m.host.clone())
                    .collect::<Vec<_>>()
            })
            .flat_map(|host| document.upstreams_for(&host))
            .collect();
        self.journal.push(Event::ProxyLoad { upstreams });
        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }
}

// ================================== DNS ======================================= //

#[derive(Default)]
pub struct RecordingDns {
    records: Mutex<Vec<(String, String)>>,
    resolutions: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl RecordingDns {
    pub fn records(&self) -> Vec<(String, String)> {
        self.records.lock().unwrap().clone()
    }

    pub fn set_resolution(&self, domain: &str, addresses: &[&str]) {
        let addresses = addresses.iter().filter_map(|a| a.parse().ok()).collect();
        self.resolutions
            .lock()
            .unwrap()
            .insert(domain.to_string(), addresses);
    }
}

#[async_trait]
impl DnsProvider for RecordingDns {
    async fn create_or_update_a_record(&self, domain: &str, ip: &str) -> Result<(), EngineError> {
        self.records
            .lock()
            .unwrap()
            .push((domain.to_string(), ip.to_string()));
        Ok(())
    }

    async fn resolve(&self, domain: &str) -> Vec<IpAddr> {
        self.resolutions
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }
}

// ================================ HARNESS ===================================== //

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<FakeRuntime>,
    pub fetcher: Arc<FakeFetcher>,
    pub probe: Arc<ScriptedProbe>,
    pub proxy: Arc<RecordingProxy>,
    pub dns: Arc<RecordingDns>,
    pub journal: Arc<Journal>,
}

pub fn test_options() -> OrchestratorOptions {
    let mut options = OrchestratorOptions::default();
    options.repos_dir = std::env::temp_dir().join(format!("frost-test-{}", uuid::Uuid::new_v4()));
    options.port_range = (21000, 21999);
    options.probe_ports = false;
    options.system_domain_suffix = Some("apps.test".to_string());
    options.controller.stop_poll_interval = Duration::from_millis(10);
    options.health_poll_interval = Duration::from_millis(20);
    options.follow.retry_delay = Duration::from_millis(20);
    options
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut OrchestratorOptions)) -> Harness {
    let mut options = test_options();
    configure(&mut options);
    harness_on(Arc::new(MemoryStore::new()), options)
}

/// Harness over an existing store, as after a restart
pub fn harness_on(store: Arc<MemoryStore>, options: OrchestratorOptions) -> Harness {
    harness_through(store.clone(), store, options)
}

/// Harness whose orchestrator reaches `store` through `backend`
pub fn harness_through(
    store: Arc<MemoryStore>,
    backend: Arc<dyn Store>,
    options: OrchestratorOptions,
) -> Harness {
    let journal = Arc::new(Journal::default());
    let runtime = Arc::new(FakeRuntime::new(journal.clone()));
    let fetcher = Arc::new(FakeFetcher::new());
    let probe = Arc::new(ScriptedProbe::new(runtime.clone()));
    let proxy = Arc::new(RecordingProxy::new(journal.clone()));
    let dns = Arc::new(RecordingDns::default());

    let orchestrator = Arc::new(Orchestrator::new(
        Collaborators {
            store: backend,
            runtime: runtime.clone(),
            fetcher: fetcher.clone(),
            probe: probe.clone(),
            proxy: proxy.clone(),
            dns: dns.clone(),
        },
        options,
    ));

    Harness {
        orchestrator,
        store,
        runtime,
        fetcher,
        probe,
        proxy,
        dns,
        journal,
    }
}

// =============================== FIXTURES ===================================== //

pub fn image_service(name: &str, replicas: u32) -> NewService {
    serde_json::from_value(serde_json::json!({
        "project_id": "prj_1",
        "project_name": "Acme",
        "name": name,
        "source": "image",
        "image_url": format!("ghcr.io/acme/{}:1.0", name),
        "container_port": 3000,
        "health_check_path": "/health",
        "health_check_timeout": 1,
        "replica_count": replicas,
        "drain_timeout": 7
    }))
    .unwrap()
}

pub fn repo_service(name: &str) -> NewService {
    let mut service = image_service(name, 1);
    service.source = SourceMode::Repo;
    service.image_url = None;
    service.repo_url = Some(format!("https://github.com/acme/{}.git", name));
    service.branch = Some("main".to_string());
    service.dockerfile_path = "docker/Dockerfile.prod".to_string();
    service.build_context = Some("apps/web".to_string());
    service
}

pub fn database_service(name: &str) -> NewService {
    let mut service = image_service(name, 1);
    service.source = SourceMode::Database;
    service.image_url = Some("postgres:16".to_string());
    service.container_port = 5432;
    service.health_check_path = None;
    service.volumes = vec![frost_engine::models::VolumeMount {
        name: format!("{}-data", name),
        path: "/var/lib/postgresql/data".to_string(),
    }];
    service
}

/// Poll until the deployment leaves its in-flight states and its task has exited
pub async fn wait_settled(orchestrator: &Orchestrator, deployment_id: &str) -> Deployment {
    let deployment = wait_for(orchestrator, deployment_id, |d| !d.status.is_in_flight()).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while orchestrator.is_deploying(&deployment.service_id).await {
        assert!(tokio::time::Instant::now() < deadline, "service never became idle");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.get_deployment(deployment_id).await.unwrap()
}

pub async fn wait_for(
    orchestrator: &Orchestrator,
    deployment_id: &str,
    predicate: impl Fn(&Deployment) -> bool,
) -> Deployment {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let deployment = orchestrator.get_deployment(deployment_id).await.unwrap();
        if predicate(&deployment) {
            return deployment;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment {} stuck in {}",
            deployment_id,
            deployment.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an arbitrary condition
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deploy and wait for `running`
pub async fn deploy_running(orchestrator: &Orchestrator, service_id: &str) -> Deployment {
    let deployment = orchestrator.create_deployment(service_id).await.unwrap();
    let deployment = wait_settled(orchestrator, &deployment.id).await;
    assert_eq!(
        deployment.status,
        DeploymentStatus::Running,
        "deployment failed: {:?}",
        deployment.error_message
    );
    deployment
}
