//! Runtime log followers
//!
//! One follower task per subscriber and replica. When the container's log
//! stream drops while the container is still running, it is reopened after a
//! fixed delay. Dropping the subscription aborts the followers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::runtime::{ContainerRuntime, LogStreamOptions};

/// A container output line tagged with its replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeLogLine {
    pub replica_index: u32,
    pub line: String,
}

/// Replica container to follow
#[derive(Debug, Clone)]
pub struct FollowTarget {
    pub replica_index: u32,
    pub container_id: String,
}

#[derive(Debug, Clone)]
pub struct FollowOptions {
    /// History lines on first attach
    pub tail: u32,

    pub timestamps: bool,

    pub retry_delay: Duration,
}

impl Default for FollowOptions {
    fn default() -> Self {
        Self {
            tail: 200,
            timestamps: false,
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Live runtime logs of one or more replicas
pub struct RuntimeLogSubscription {
    receiver: mpsc::Receiver<RuntimeLogLine>,
    followers: Vec<JoinHandle<()>>,
}

impl RuntimeLogSubscription {
    /// Next line, `None` once every followed container has stopped
    pub async fn next_line(&mut self) -> Option<RuntimeLogLine> {
        self.receiver.recv().await
    }
}

impl Drop for RuntimeLogSubscription {
    fn drop(&mut self) {
        for follower in &self.followers {
            follower.abort();
        }
    }
}

async fn follow(
    runtime: Arc<dyn ContainerRuntime>,
    target: FollowTarget,
    options: FollowOptions,
    tx: mpsc::Sender<RuntimeLogLine>,
) {
    let mut tail = Some(options.tail);

    loop {
        let stream_options = LogStreamOptions {
            tail,
            timestamps: options.timestamps,
            follow: true,
        };

        match runtime.logs(&target.container_id, &stream_options).await {
            Ok(mut lines) => loop {
                tokio::select! {
                    line = lines.next() => match line {
                        Some(line) => {
                            let event = RuntimeLogLine {
                                replica_index: target.replica_index,
                                line,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => return,
                }
            },
            Err(e) => warn!("Failed to open logs of {}: {}", target.container_id, e),
        }

        // History was already delivered; only new output after a reconnect.
        tail = Some(0);

        match runtime.inspect(&target.container_id).await {
            Ok(state) if state.running => {}
            Ok(_) => {
                debug!("Container {} stopped, ending log follow", target.container_id);
                return;
            }
            Err(e) => {
                warn!("Failed to inspect {}: {}", target.container_id, e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(options.retry_delay) => {}
            _ = tx.closed() => return,
        }
        debug!("Reopening log stream of {}", target.container_id);
    }
}

/// Start following the given replicas into one subscription
pub fn follow_runtime_logs(
    runtime: Arc<dyn ContainerRuntime>,
    targets: Vec<FollowTarget>,
    options: FollowOptions,
) -> RuntimeLogSubscription {
    let (tx, receiver) = mpsc::channel(256);
    let followers = targets
        .into_iter()
        .map(|target| {
            tokio::spawn(follow(runtime.clone(), target, options.clone(), tx.clone()))
        })
        .collect();

    RuntimeLogSubscription {
        receiver,
        followers,
    }
}
