//! Reverse proxy configuration

pub mod document;
pub mod sync;

pub use document::{build_document, CaddyConfig, DocumentOptions, ServiceUpstreams};
pub use sync::{CaddyAdmin, ProxySynchronizer, ReverseProxy};
