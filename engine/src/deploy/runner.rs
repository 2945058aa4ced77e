//! Deployment state machine driver
//!
//! One runner invocation per deployment: fetch, build, roll out, each stage
//! under its own timeout. Cancellation is cooperative and only observed
//! between stages. Every transition persists the status and the build log
//! accumulated so far.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::deploy::build::BuildExecutor;
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, StageTimeouts};
use crate::deploy::git::FetchMode;
use crate::deploy::replicas::ReplicaSetController;
use crate::errors::EngineError;
use crate::models::{Deployment, DeploymentStatus, Service, SourceMode};
use crate::runtime::{ContainerRuntime, LineSink};
use crate::store::Store;
use crate::stream::{BuildLog, LogHub};

/// Cooperative cancellation flag shared with the orchestrator
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the image of a deployment comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploySource {
    /// The service's configured source: clone and build, or pull the image reference
    Service,

    /// A previously built image already in the local store (rollback)
    Snapshot(String),
}

/// Why the pipeline stopped early
enum Halt {
    Cancelled,
    Failed(EngineError),
}

impl From<EngineError> for Halt {
    fn from(e: EngineError) -> Self {
        Halt::Failed(e)
    }
}

async fn with_timeout<T, F>(stage: &str, limit: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        EngineError::Timeout(format!("{} exceeded {:?}", stage, limit))
    })?
}

pub struct DeploymentRunner {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<BuildExecutor>,
    controller: Arc<ReplicaSetController>,
    logs: Arc<LogHub>,
    timeouts: StageTimeouts,
}

impl DeploymentRunner {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<BuildExecutor>,
        controller: Arc<ReplicaSetController>,
        logs: Arc<LogHub>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            store,
            runtime,
            builder,
            controller,
            logs,
            timeouts,
        }
    }

    /// Drive a pending deployment to a terminal state (or `running`)
    pub async fn run(
        &self,
        service: Service,
        mut deployment: Deployment,
        source: DeploySource,
        cancel: CancelFlag,
    ) -> Deployment {
        let log = self.logs.open(&deployment.id);
        let mut fsm = DeploymentFsm::new();

        // Process output arrives on a channel and is appended in order.
        let (sink, mut lines) = mpsc::unbounded_channel::<String>();
        let forward_log = log.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                forward_log.append(line);
            }
        });

        info!(
            "Deployment {} of service {} started",
            deployment.id, service.name
        );

        let outcome = self
            .drive(&service, &mut deployment, &mut fsm, &source, &cancel, &log, &sink)
            .await;

        let event = match outcome {
            Ok(()) => DeploymentEvent::Succeed,
            Err(Halt::Cancelled) => {
                log.append("Deployment cancelled");
                DeploymentEvent::Cancel
            }
            Err(Halt::Failed(e)) => {
                warn!("Deployment {} failed: {}", deployment.id, e);
                log.append(format!("Deployment failed: {}", e));
                DeploymentEvent::Fail(e.to_string())
            }
        };

        drop(sink);
        if let Err(e) = forwarder.await {
            warn!("Build log forwarder for {} ended abnormally: {}", deployment.id, e);
        }

        // Final transition only after every process line has been appended
        if let Err(e) = self.transition(&mut fsm, &mut deployment, event, &log).await {
            error!("Failed to record outcome of {}: {}", deployment.id, e);
        }

        self.logs.close(&deployment.id);
        info!(
            "Deployment {} finished as {}",
            deployment.id, deployment.status
        );
        deployment
    }

    async fn flush(&self, deployment: &mut Deployment, log: &BuildLog) -> Result<(), EngineError> {
        deployment.build_log = log.text();
        self.store.put_deployment(deployment).await
    }

    async fn transition(
        &self,
        fsm: &mut DeploymentFsm,
        deployment: &mut Deployment,
        event: DeploymentEvent,
        log: &BuildLog,
    ) -> Result<(), EngineError> {
        let status = fsm.process(event).map_err(EngineError::Internal)?;
        log.append(format!("==> {}", status));

        deployment.status = status;
        deployment.error_message = fsm.error().map(str::to_string);
        if status == DeploymentStatus::Running || status.is_terminal() {
            deployment.finished_at = Some(Utc::now());
        }
        self.flush(deployment, log).await
    }

    fn check_cancel(cancel: &CancelFlag) -> Result<(), Halt> {
        if cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        service: &Service,
        deployment: &mut Deployment,
        fsm: &mut DeploymentFsm,
        source: &DeploySource,
        cancel: &CancelFlag,
        log: &Arc<BuildLog>,
        sink: &LineSink,
    ) -> Result<(), Halt> {
        let (image, needs_pull) = match source {
            DeploySource::Snapshot(image) => (image.clone(), false),
            DeploySource::Service if service.source.needs_build() => {
                (self.fetch_and_build(service, deployment, fsm, cancel, log, sink).await?, false)
            }
            DeploySource::Service => {
                let image = service.image_url.clone().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "{} service {} has no image reference",
                        service.source, service.name
                    ))
                })?;
                (image, true)
            }
        };

        deployment.image_name = Some(image.clone());
        Self::check_cancel(cancel)?;
        self.transition(fsm, deployment, DeploymentEvent::Deploy, log)
            .await?;

        // Only start and health gate run under the stage timeout; the switch
        // must not be interrupted halfway.
        let staging = async {
            if needs_pull {
                self.pull(&image, service.source, sink).await?;
            }
            self.controller.stage(service, deployment, &image, log).await
        };

        let staged = match tokio::time::timeout(self.timeouts.rollout, staging).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "rollout exceeded {:?}",
                self.timeouts.rollout
            ))),
        };
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(abort_err) = self.controller.abort_deployment(&deployment.id).await {
                    warn!("Failed to abort rollout {}: {}", deployment.id, abort_err);
                }
                return Err(e.into());
            }
        };

        let outcome = self.controller.commit(deployment, staged, log).await?;

        if let Some(first) = outcome.replicas.first() {
            deployment.host_port = Some(first.host_port);
            deployment.container_id = first.container_id.clone();
        }
        Ok(())
    }

    async fn fetch_and_build(
        &self,
        service: &Service,
        deployment: &mut Deployment,
        fsm: &mut DeploymentFsm,
        cancel: &CancelFlag,
        log: &Arc<BuildLog>,
        sink: &LineSink,
    ) -> Result<String, Halt> {
        Self::check_cancel(cancel)?;
        let event = if self.builder.has_checkout(service).await {
            DeploymentEvent::Pull
        } else {
            DeploymentEvent::Clone
        };
        self.transition(fsm, deployment, event, log).await?;

        let revision = with_timeout(
            "source fetch",
            self.timeouts.fetch,
            self.builder.fetch(service, sink),
        )
        .await?;
        if revision.mode == FetchMode::Cloned {
            log.append(format!("Cloned at {}", revision.commit_sha));
        }
        deployment.commit_sha = Some(revision.commit_sha);
        deployment.commit_message = Some(revision.commit_message);

        Self::check_cancel(cancel)?;
        self.transition(fsm, deployment, DeploymentEvent::Build, log)
            .await?;

        let tag = with_timeout(
            "image build",
            self.timeouts.build,
            self.builder.build(service, deployment, sink),
        )
        .await?;
        Ok(tag)
    }

    async fn pull(&self, image: &str, mode: SourceMode, sink: &LineSink) -> Result<(), EngineError> {
        let _ = sink.send(format!("Pulling {} image {}", mode, image));
        match self.runtime.pull(image, sink).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.runtime.image_exists(image).await? {
                    warn!("Pull of {} failed, using local copy: {}", image, e);
                    let _ = sink.send(format!("Pull failed, using local image {}", image));
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}
