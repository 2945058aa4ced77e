//! Container runtime seam
//!
//! The orchestrator drives the runtime as a black box: build, pull, run,
//! stop, logs, inspect. `DockerCli` is the production implementation.

pub mod docker;
pub mod ports;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::models::{ResourceLimits, VolumeMount};

pub use docker::DockerCli;
pub use ports::PortAllocator;

/// Receiver side of streamed process output, one line per message
pub type LineSink = mpsc::UnboundedSender<String>;

/// Image build request
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory sent to the builder
    pub context_dir: PathBuf,

    /// Dockerfile path relative to `context_dir`
    pub dockerfile: String,

    /// Image tag to produce
    pub tag: String,
}

/// Result of an image build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub success: bool,

    /// Combined stdout and stderr
    pub log: String,
}

/// Everything needed to start one replica container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,

    pub image: String,

    /// Host port bound on the loopback interface
    pub host_port: u16,

    pub container_port: u16,

    pub env: BTreeMap<String, String>,

    pub volumes: Vec<VolumeMount>,

    pub limits: ResourceLimits,

    pub network: Option<String>,

    pub labels: BTreeMap<String, String>,
}

/// Options for reading container output
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    /// Lines of history to emit first
    pub tail: Option<u32>,

    pub timestamps: bool,

    /// Keep the stream open for new output
    pub follow: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            tail: Some(200),
            timestamps: false,
            follow: true,
        }
    }
}

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,

    /// `None` when the container no longer exists
    pub exit_code: Option<i64>,
}

impl ContainerState {
    pub fn gone() -> Self {
        Self {
            running: false,
            exit_code: None,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image, forwarding output lines to `sink` as they are produced
    async fn build(&self, request: &BuildRequest, sink: &LineSink)
        -> Result<BuildOutput, EngineError>;

    /// Pull an image from its registry
    async fn pull(&self, image: &str, sink: &LineSink) -> Result<(), EngineError>;

    /// Start a detached container and return its id
    async fn run(&self, spec: &RunSpec) -> Result<String, EngineError>;

    /// Issue a stop with a grace period. Returns once the signal is issued,
    /// not when the container has exited.
    async fn stop(&self, container_id: &str, grace_secs: u64) -> Result<(), EngineError>;

    /// Stream container stdout and stderr lines
    async fn logs(
        &self,
        container_id: &str,
        options: &LogStreamOptions,
    ) -> Result<BoxStream<'static, String>, EngineError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;
}
