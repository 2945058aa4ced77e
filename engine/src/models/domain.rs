//! Domain models

use serde::{Deserialize, Serialize};

/// How a hostname is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainType {
    /// Reverse-proxied to the service's replicas
    Proxy,
    /// Redirected to another URL
    Redirect,
    /// Routed to the platform's own admin UI
    FrostAdmin,
}

impl DomainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Proxy => "proxy",
            DomainType::Redirect => "redirect",
            DomainType::FrostAdmin => "frost-admin",
        }
    }
}

impl std::fmt::Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslStatus {
    Pending,
    Active,
}

/// A hostname routed to a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,

    /// Owning service. `None` only for admin domains.
    #[serde(default)]
    pub service_id: Option<String>,

    pub domain: String,

    #[serde(rename = "type")]
    pub domain_type: DomainType,

    pub dns_verified: bool,

    pub ssl_status: SslStatus,

    /// Platform-generated default hostname
    #[serde(default)]
    pub is_system: bool,

    #[serde(default)]
    pub redirect_target: Option<String>,

    #[serde(default)]
    pub redirect_code: Option<u16>,

    /// Per-domain upstream response timeout, in seconds
    #[serde(default)]
    pub request_timeout: Option<u64>,
}

impl Domain {
    /// Default redirect status code when none is configured
    pub const DEFAULT_REDIRECT_CODE: u16 = 301;

    pub fn new(service_id: Option<&str>, domain: &str, domain_type: DomainType) -> Self {
        Self {
            id: super::new_id(),
            service_id: service_id.map(str::to_string),
            domain: domain.trim().to_lowercase(),
            domain_type,
            dns_verified: false,
            ssl_status: SslStatus::Pending,
            is_system: false,
            redirect_target: None,
            redirect_code: None,
            request_timeout: None,
        }
    }
}

/// Input for adding a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDomain {
    /// Required unless the domain routes to the admin UI
    #[serde(default)]
    pub service_id: Option<String>,

    pub domain: String,

    #[serde(rename = "type", default = "default_domain_type")]
    pub domain_type: DomainType,

    #[serde(default)]
    pub redirect_target: Option<String>,

    #[serde(default)]
    pub redirect_code: Option<u16>,

    #[serde(default)]
    pub request_timeout: Option<u64>,
}

fn default_domain_type() -> DomainType {
    DomainType::Proxy
}

/// Check a hostname is syntactically valid
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 || !host.contains('.') {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
