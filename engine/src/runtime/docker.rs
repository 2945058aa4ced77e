//! Docker CLI runtime

use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{collect_output, merge_output};
use super::{
    BuildOutput, BuildRequest, ContainerRuntime, ContainerState, LineSink, LogStreamOptions,
    RunSpec,
};
use crate::errors::EngineError;

/// Container runtime driven through the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Create the shared service network if it does not exist yet
    pub async fn ensure_network(&self, network: &str) -> Result<(), EngineError> {
        let exists = self
            .command()
            .args(["network", "inspect", network])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| spawn_error("network inspect", e))?;
        if exists.success() {
            return Ok(());
        }

        info!("Creating docker network: {}", network);
        let output = self
            .command()
            .args(["network", "create", network])
            .output()
            .await
            .map_err(|e| spawn_error("network create", e))?;
        if !output.status.success() {
            return Err(EngineError::Infrastructure(format!(
                "docker network create {} failed: {}",
                network,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Check that the docker daemon answers
    pub async fn ping(&self) -> Result<String, EngineError> {
        let output = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| spawn_error("version", e))?;
        if !output.status.success() {
            return Err(EngineError::Infrastructure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn spawn_error(what: &str, e: std::io::Error) -> EngineError {
    EngineError::Infrastructure(format!("Failed to run docker {}: {}", what, e))
}

/// Build the `docker run` argument list for a replica
pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
        "-p".to_string(),
        format!("127.0.0.1:{}:{}", spec.host_port, spec.container_port),
    ];

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(format!("{}:{}", volume.name, volume.path));
    }
    if let Some(memory) = spec.limits.memory_mb {
        args.push("--memory".to_string());
        args.push(format!("{}m", memory));
    }
    if let Some(cpus) = spec.limits.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build(
        &self,
        request: &BuildRequest,
        sink: &LineSink,
    ) -> Result<BuildOutput, EngineError> {
        info!("Building image {} from {}", request.tag, request.context_dir.display());

        let mut child = self
            .command()
            .current_dir(&request.context_dir)
            .env("DOCKER_BUILDKIT", "1")
            .args([
                "build",
                "--progress=plain",
                "-f",
                request.dockerfile.as_str(),
                "-t",
                request.tag.as_str(),
                ".",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("build", e))?;

        let log = collect_output(&mut child, sink).await;
        let status = child.wait().await?;

        debug!("docker build exited with {}", status);
        Ok(BuildOutput {
            success: status.success(),
            log,
        })
    }

    async fn pull(&self, image: &str, sink: &LineSink) -> Result<(), EngineError> {
        debug!("Pulling image: {}", image);

        let mut child = self
            .command()
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("pull", e))?;

        collect_output(&mut child, sink).await;
        let status = child.wait().await?;

        if !status.success() {
            return Err(EngineError::Infrastructure(format!(
                "Docker pull failed for {}",
                image
            )));
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, EngineError> {
        debug!("Running container {} on host port {}", spec.name, spec.host_port);

        let output = self
            .command()
            .args(run_args(spec))
            .output()
            .await
            .map_err(|e| spawn_error("run", e))?;

        if !output.status.success() {
            return Err(EngineError::Infrastructure(format!(
                "Docker run failed for {}: {}",
                spec.image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(EngineError::Infrastructure(format!(
                "Docker run returned no container id for {}",
                spec.name
            )));
        }
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, grace_secs: u64) -> Result<(), EngineError> {
        debug!("Stopping container {} with {}s grace", container_id, grace_secs);

        // Not kill_on_drop: the stop must outlive this call.
        let grace = grace_secs.to_string();
        let mut child = Command::new(&self.bin)
            .args(["stop", "-t", grace.as_str(), container_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error("stop", e))?;

        let container_id = container_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!("Container {} stopped", container_id);
                }
                Ok(status) => warn!("docker stop {} exited with {}", container_id, status),
                Err(e) => warn!("docker stop {} failed: {}", container_id, e),
            }
        });
        Ok(())
    }

    async fn logs(
        &self,
        container_id: &str,
        options: &LogStreamOptions,
    ) -> Result<BoxStream<'static, String>, EngineError> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = options.tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if options.timestamps {
            args.push("--timestamps".to_string());
        }
        if options.follow {
            args.push("--follow".to_string());
        }
        args.push(container_id.to_string());

        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("logs", e))?;

        let rx = merge_output(&mut child);

        // The child rides along in the stream state so dropping the stream kills it.
        let lines = stream::unfold((rx, child), |(mut rx, child)| async move {
            rx.recv().await.map(|line| (line, (rx, child)))
        });
        Ok(lines.boxed())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        let output = self
            .command()
            .args([
                "inspect",
                "--format",
                "{{.State.Running}}|{{.State.ExitCode}}",
                container_id,
            ])
            .output()
            .await
            .map_err(|e| spawn_error("inspect", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(ContainerState::gone());
            }
            return Err(EngineError::Infrastructure(format!(
                "docker inspect {} failed: {}",
                container_id,
                stderr.trim()
            )));
        }

        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| spawn_error("image inspect", e))?;
        Ok(status.success())
    }
}

fn parse_inspect(output: &str) -> Result<ContainerState, EngineError> {
    let line = output.trim();
    let (running, exit_code) = line.split_once('|').ok_or_else(|| {
        EngineError::Infrastructure(format!("unexpected docker inspect output: {}", line))
    })?;
    Ok(ContainerState {
        running: running == "true",
        exit_code: exit_code.parse().ok(),
    })
}
