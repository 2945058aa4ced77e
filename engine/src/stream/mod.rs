//! Log broadcasting for build and runtime output

pub mod build_log;
pub mod runtime_log;

pub use build_log::{BuildLog, LogHub, LogSubscription};
pub use runtime_log::{
    follow_runtime_logs, FollowOptions, FollowTarget, RuntimeLogLine, RuntimeLogSubscription,
};
