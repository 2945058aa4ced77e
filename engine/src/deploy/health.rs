//! Health gate: poll a replica until it answers or the timeout elapses

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Where a replica can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Loopback host port
    HostPort(u16),

    /// Address reachable on the container network (`host:port`)
    Address(String),
}

impl ProbeTarget {
    pub fn authority(&self) -> String {
        match self {
            ProbeTarget::HostPort(port) => format!("127.0.0.1:{}", port),
            ProbeTarget::Address(addr) => addr.clone(),
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A single health probe attempt. Failure is a normal outcome, not an error.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, path: Option<&str>) -> bool;
}

/// HTTP GET probe, success on any 2xx. Falls back to a TCP connect when the
/// service has no health check path.
pub struct HttpProbe {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget, path: Option<&str>) -> bool {
        match path {
            Some(path) => {
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{}", path)
                };
                let url = format!("http://{}{}", target.authority(), path);
                match self.client.get(&url).send().await {
                    Ok(response) => {
                        let ok = response.status().is_success();
                        if !ok {
                            debug!("Health probe {} returned {}", url, response.status());
                        }
                        ok
                    }
                    Err(e) => {
                        debug!("Health probe {} failed: {}", url, e);
                        false
                    }
                }
            }
            None => matches!(
                tokio::time::timeout(self.request_timeout, TcpStream::connect(target.authority()))
                    .await,
                Ok(Ok(_))
            ),
        }
    }
}

/// Outcome of gating one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Bounded polling over a health probe
#[derive(Clone)]
pub struct HealthGate {
    probe: Arc<dyn HealthProbe>,
    poll_interval: Duration,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn HealthProbe>, poll_interval: Duration) -> Self {
        Self {
            probe,
            poll_interval,
        }
    }

    /// Poll `target` until a probe succeeds or `timeout` elapses. Never errors.
    pub async fn wait_healthy(
        &self,
        target: &ProbeTarget,
        path: Option<&str>,
        timeout: Duration,
    ) -> HealthVerdict {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let healthy = tokio::time::timeout(remaining, self.probe.probe(target, path))
                .await
                .unwrap_or(false);

            if healthy {
                info!(
                    "{} healthy after {} attempt(s) in {:?}",
                    target,
                    attempts,
                    started.elapsed()
                );
                return HealthVerdict {
                    healthy: true,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            if Instant::now() + self.poll_interval >= deadline {
                warn!(
                    "{} not healthy within {:?} ({} attempts)",
                    target, timeout, attempts
                );
                return HealthVerdict {
                    healthy: false,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
