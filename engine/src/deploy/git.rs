//! Git source fetching

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::runtime::process::collect_output;
use crate::runtime::LineSink;

/// How the working tree was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Cloned,
    Pulled,
}

/// Checked-out revision
#[derive(Debug, Clone)]
pub struct SourceRevision {
    pub commit_sha: String,
    pub commit_message: String,
    pub mode: FetchMode,
}

/// Brings a repository branch into a local build context
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Whether `dir` already holds a checkout, so the fetch will be a pull
    async fn has_checkout(&self, dir: &Path) -> bool {
        tokio::fs::metadata(dir.join(".git")).await.is_ok()
    }

    /// Clone or update `dir` to the tip of `branch`
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dir: &Path,
        sink: &LineSink,
    ) -> Result<SourceRevision, EngineError>;
}

/// Source fetcher driven through the `git` binary
#[derive(Debug, Clone)]
pub struct GitCli {
    bin: String,
}

impl GitCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>, sink: &LineSink) -> Result<(), EngineError> {
        let mut cmd = Command::new(&self.bin);
        cmd.kill_on_drop(true)
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Infrastructure(format!("Failed to run git {}: {}", args[0], e))
        })?;
        collect_output(&mut child, sink).await;
        let status = child.wait().await?;

        if !status.success() {
            return Err(EngineError::BuildFailure(format!(
                "git {} failed ({})",
                args[0], status
            )));
        }
        Ok(())
    }

    async fn head(&self, dir: &Path) -> Result<(String, String), EngineError> {
        let output = Command::new(&self.bin)
            .current_dir(dir)
            .args(["log", "-1", "--format=%H%n%s"])
            .output()
            .await
            .map_err(|e| EngineError::Infrastructure(format!("Failed to run git log: {}", e)))?;

        if !output.status.success() {
            return Err(EngineError::BuildFailure(
                "git log failed on fresh checkout".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines = text.lines();
        let sha = lines.next().unwrap_or_default().trim().to_string();
        let message = lines.next().unwrap_or_default().trim().to_string();
        Ok((sha, message))
    }
}

#[async_trait]
impl SourceFetcher for GitCli {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dir: &Path,
        sink: &LineSink,
    ) -> Result<SourceRevision, EngineError> {
        info!("Syncing Git repository: {} (branch: {}) to {}", repo_url, branch, dir.display());

        let mode = if self.has_checkout(dir).await {
            debug!("Target directory exists, fetching updates...");
            self.git(&["fetch", "--depth", "1", "origin", branch], Some(dir), sink)
                .await?;
            self.git(&["reset", "--hard", "FETCH_HEAD"], Some(dir), sink)
                .await?;
            self.git(&["clean", "-fdx"], Some(dir), sink).await?;
            FetchMode::Pulled
        } else {
            debug!("Cloning repository to {}...", dir.display());
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let target = dir.to_string_lossy();
            self.git(
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--branch",
                    branch,
                    repo_url,
                    target.as_ref(),
                ],
                None,
                sink,
            )
            .await?;
            FetchMode::Cloned
        };

        let (commit_sha, commit_message) = self.head(dir).await?;
        info!("Checked out {} at {}", branch, commit_sha);

        Ok(SourceRevision {
            commit_sha,
            commit_message,
            mode,
        })
    }
}
