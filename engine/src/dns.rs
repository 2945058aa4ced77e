//! DNS provider seam

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::EngineError;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Point `domain` at `ip`
    async fn create_or_update_a_record(&self, domain: &str, ip: &str) -> Result<(), EngineError>;

    /// Current addresses of `domain`, empty when it does not resolve
    async fn resolve(&self, domain: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((domain, 80)).await {
            Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
            Err(e) => {
                debug!("{} does not resolve: {}", domain, e);
                Vec::new()
            }
        }
    }
}

/// Provider for hosts whose records are managed by hand
#[derive(Debug, Default, Clone)]
pub struct NoopDns;

#[async_trait]
impl DnsProvider for NoopDns {
    async fn create_or_update_a_record(&self, domain: &str, ip: &str) -> Result<(), EngineError> {
        debug!("Skipping A record {} -> {}: no DNS provider configured", domain, ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_accepts_records() {
        tokio_test::assert_ok!(tokio_test::block_on(
            NoopDns.create_or_update_a_record("web-acme.apps.example.com", "203.0.113.10")
        ));
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = tokio_test::block_on(NoopDns.resolve("localhost"));
        assert!(addrs.iter().any(|ip| ip.is_loopback()));
    }
}
