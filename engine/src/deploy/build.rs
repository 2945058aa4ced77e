//! Build executor
//!
//! Resolves the build context of a repo-mode service, fetches the source and
//! produces a uniquely tagged image.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::deploy::git::{SourceFetcher, SourceRevision};
use crate::errors::EngineError;
use crate::models::{Deployment, Service};
use crate::runtime::{BuildRequest, ContainerRuntime, LineSink};
use crate::utils::slugify;

/// Split a repo-relative path into normalized components
fn normalize(path: &str) -> Result<Vec<String>, EngineError> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(EngineError::Validation(format!(
                        "path {} escapes the repository root",
                        path
                    )));
                }
            }
        }
    }
    Ok(parts)
}

/// Dockerfile path handed to the builder
///
/// Without a build context the Dockerfile path is used as configured and the
/// context is the repository root. With one, the path is rewritten relative
/// to the context directory, which may climb out of it (`../../docker/Dockerfile`).
pub fn resolve_dockerfile_path(
    dockerfile: &str,
    build_context: Option<&str>,
) -> Result<String, EngineError> {
    let context = match build_context.map(str::trim) {
        Some(context) if !context.is_empty() => context,
        _ => return Ok(dockerfile.to_string()),
    };

    let context_parts = normalize(context)?;
    let dockerfile_parts = normalize(dockerfile)?;
    if dockerfile_parts.is_empty() {
        return Err(EngineError::Validation(format!(
            "invalid dockerfile path {}",
            dockerfile
        )));
    }

    let common = context_parts
        .iter()
        .zip(dockerfile_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative: Vec<&str> = Vec::new();
    for _ in common..context_parts.len() {
        relative.push("..");
    }
    for part in &dockerfile_parts[common..] {
        relative.push(part.as_str());
    }
    Ok(relative.join("/"))
}

/// Directory sent to the builder for a checkout
pub fn resolve_context_dir(
    checkout: &Path,
    build_context: Option<&str>,
) -> Result<PathBuf, EngineError> {
    match build_context.map(str::trim) {
        Some(context) if !context.is_empty() => {
            let mut dir = checkout.to_path_buf();
            for part in normalize(context)? {
                dir.push(part);
            }
            Ok(dir)
        }
        _ => Ok(checkout.to_path_buf()),
    }
}

/// Unique, sortable image tag for a deployment
pub fn image_tag(service: &Service, deployment: &Deployment) -> String {
    format!(
        "frost-{}:{}-{}",
        slugify(&service.name, 40),
        deployment.created_at.timestamp(),
        deployment.short_id()
    )
}

/// Build context and image producer for repo-mode services
pub struct BuildExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn SourceFetcher>,
    repos_dir: PathBuf,
}

impl BuildExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn SourceFetcher>,
        repos_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            fetcher,
            repos_dir: repos_dir.into(),
        }
    }

    /// One persistent checkout per service
    pub fn checkout_dir(&self, service: &Service) -> PathBuf {
        self.repos_dir.join(&service.id)
    }

    /// Whether the next fetch for this service will be a pull rather than a clone
    pub async fn has_checkout(&self, service: &Service) -> bool {
        self.fetcher.has_checkout(&self.checkout_dir(service)).await
    }

    /// Clone or pull the service's branch
    pub async fn fetch(
        &self,
        service: &Service,
        sink: &LineSink,
    ) -> Result<SourceRevision, EngineError> {
        let repo_url = service.repo_url.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("service {} has no repository url", service.name))
        })?;
        let branch = service.branch.as_deref().unwrap_or("main");

        self.fetcher
            .fetch(repo_url, branch, &self.checkout_dir(service), sink)
            .await
    }

    /// Build the checked-out source into a fresh image tag
    pub async fn build(
        &self,
        service: &Service,
        deployment: &Deployment,
        sink: &LineSink,
    ) -> Result<String, EngineError> {
        let checkout = self.checkout_dir(service);
        let context_dir = resolve_context_dir(&checkout, service.build_context.as_deref())?;
        let dockerfile =
            resolve_dockerfile_path(&service.dockerfile_path, service.build_context.as_deref())?;
        let tag = image_tag(service, deployment);

        let _ = sink.send(format!(
            "Building {} (dockerfile: {}, context: {})",
            tag,
            dockerfile,
            service.build_context.as_deref().unwrap_or(".")
        ));

        let request = BuildRequest {
            context_dir,
            dockerfile,
            tag: tag.clone(),
        };
        let output = self.runtime.build(&request, sink).await?;

        if !output.success {
            warn!("Build failed for deployment {}", deployment.id);
            return Err(EngineError::BuildFailure(match output.log.lines().last() {
                Some(last) => format!("image build exited with an error: {}", last),
                None => "image build exited with an error".to_string(),
            }));
        }

        info!("Built image {}", tag);
        Ok(tag)
    }
}
