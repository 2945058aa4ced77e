//! Deployment pipeline

pub mod build;
pub mod fsm;
pub mod git;
pub mod health;
pub mod replicas;
pub mod rollback;
pub mod runner;

pub use build::BuildExecutor;
pub use fsm::{DeploymentEvent, DeploymentFsm, StageTimeouts};
pub use git::{GitCli, SourceFetcher, SourceRevision};
pub use health::{HealthGate, HealthProbe, HttpProbe, ProbeTarget};
pub use replicas::{ControllerOptions, ReplicaSetController, RolloutOutcome, StagedRollout};
pub use rollback::{RollbackCoordinator, RollbackPlan};
pub use runner::{CancelFlag, DeploySource, DeploymentRunner};
