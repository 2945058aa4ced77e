//! Frost Engine Library
//!
//! Deployment orchestration for a single-node self-hosted platform: builds,
//! zero-downtime replica rollouts, reverse-proxy sync, rollback and live logs.

pub mod app;
pub mod deploy;
pub mod diagnostic;
pub mod dns;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod orchestrator;
pub mod proxy;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod store;
pub mod stream;
pub mod utils;
pub mod workers;
