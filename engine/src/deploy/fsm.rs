//! Finite State Machine for deployment progression

use std::time::Duration;

use crate::models::DeploymentStatus;

/// Per-stage timeouts
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    /// Timeout for cloning or pulling the repository
    pub fetch: Duration,

    /// Timeout for building the image
    pub build: Duration,

    /// Timeout for pulling, starting and health gating replicas
    pub rollout: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(300),
            build: Duration::from_secs(1800),
            rollout: Duration::from_secs(600),
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start a fresh clone
    Clone,

    /// Update an existing checkout
    Pull,

    /// Start the image build
    Build,

    /// Start the rollout (entered directly for image, database and rollback deployments)
    Deploy,

    /// Rollout switched traffic to the new replicas
    Succeed,

    /// Any stage failed
    Fail(String),

    /// Cancellation observed between stages
    Cancel,

    /// Manual stop of a running deployment
    Stop,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Pending,
            error: None,
        }
    }

    /// Resume an FSM from a persisted status
    pub fn from_status(state: DeploymentStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, String> {
        use DeploymentStatus as S;

        let new_state = match (&self.state, &event) {
            // From Pending
            (S::Pending, DeploymentEvent::Clone) => S::Cloning,
            (S::Pending, DeploymentEvent::Pull) => S::Pulling,
            (S::Pending, DeploymentEvent::Deploy) => S::Deploying,

            // From Cloning / Pulling
            (S::Cloning | S::Pulling, DeploymentEvent::Build) => S::Building,

            // From Building
            (S::Building, DeploymentEvent::Deploy) => S::Deploying,

            // From Deploying
            (S::Deploying, DeploymentEvent::Succeed) => S::Running,

            // From Running
            (S::Running, DeploymentEvent::Stop) => S::Stopped,

            // Any in-flight stage can fail or be cancelled
            (state, DeploymentEvent::Fail(err)) if state.is_in_flight() => {
                self.error = Some(err.clone());
                S::Failed
            }
            (state, DeploymentEvent::Cancel) if state.is_in_flight() => S::Cancelled,

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
