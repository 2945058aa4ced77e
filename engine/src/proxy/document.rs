//! Caddy JSON routing document
//!
//! The document is derived purely from domains and the running upstreams of
//! each service's current deployment. Building it has no side effects.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Domain, DomainType};

/// Name of the single HTTP server block
pub const SERVER_NAME: &str = "frost";

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaddyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    pub apps: Apps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub listen: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apps {
    pub http: HttpApp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsApp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpApp {
    pub servers: BTreeMap<String, Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub listen: Vec<String>,

    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub matchers: Vec<HostMatch>,

    pub handle: Vec<Handler>,

    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMatch {
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    ReverseProxy {
        upstreams: Vec<Upstream>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        load_balancing: Option<LoadBalancing>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<Transport>,
    },
    StaticResponse {
        headers: BTreeMap<String, Vec<String>>,

        status_code: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancing {
    pub selection_policy: SelectionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub policy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    pub protocol: String,

    /// Nanoseconds
    pub response_header_timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsApp {
    pub automation: TlsAutomation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsAutomation {
    pub policies: Vec<TlsPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsPolicy {
    pub issuers: Vec<AcmeIssuer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeIssuer {
    pub module: String,
    pub email: String,
}

impl CaddyConfig {
    /// Routes of the platform server block
    pub fn routes(&self) -> &[Route] {
        self.apps
            .http
            .servers
            .get(SERVER_NAME)
            .map(|server| server.routes.as_slice())
            .unwrap_or(&[])
    }

    /// Route matching a hostname
    pub fn route_for(&self, host: &str) -> Option<&Route> {
        self.routes()
            .iter()
            .find(|route| route.matchers.iter().any(|m| m.host.iter().any(|h| h == host)))
    }

    /// Upstream dial addresses for a hostname, empty when it is not proxied
    pub fn upstreams_for(&self, host: &str) -> Vec<String> {
        self.route_for(host)
            .into_iter()
            .flat_map(|route| route.handle.iter())
            .flat_map(|handler| match handler {
                Handler::ReverseProxy { upstreams, .. } => {
                    upstreams.iter().map(|u| u.dial.clone()).collect()
                }
                Handler::StaticResponse { .. } => Vec::new(),
            })
            .collect()
    }
}

/// Static inputs of the document
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Admin API listen address kept in the pushed config
    pub admin_listen: Option<String>,

    pub listen: Vec<String>,

    /// Local port of the platform's own admin UI
    pub admin_ui_port: u16,

    pub acme_email: Option<String>,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            admin_listen: None,
            listen: vec![":80".to_string(), ":443".to_string()],
            admin_ui_port: 3000,
            acme_email: None,
        }
    }
}

/// Running upstreams of one service's current deployment
#[derive(Debug, Clone, Default)]
pub struct ServiceUpstreams {
    /// Host ports ordered by replica index
    pub ports: Vec<u16>,

    /// Service-level response header timeout in seconds
    pub request_timeout: Option<u64>,
}

fn reverse_proxy(dials: Vec<String>, timeout_secs: Option<u64>) -> Handler {
    let load_balancing = (dials.len() > 1).then(|| LoadBalancing {
        selection_policy: SelectionPolicy {
            policy: "round_robin".to_string(),
        },
    });
    let transport = timeout_secs.filter(|secs| *secs > 0).map(|secs| Transport {
        protocol: "http".to_string(),
        response_header_timeout: secs * NANOS_PER_SEC,
    });

    Handler::ReverseProxy {
        upstreams: dials.into_iter().map(|dial| Upstream { dial }).collect(),
        load_balancing,
        transport,
    }
}

fn host_route(host: &str, handler: Handler) -> Route {
    Route {
        matchers: vec![HostMatch {
            host: vec![host.to_string()],
        }],
        handle: vec![handler],
        terminal: true,
    }
}

fn domain_route(
    domain: &Domain,
    options: &DocumentOptions,
    upstreams: &HashMap<String, ServiceUpstreams>,
) -> Option<Route> {
    match domain.domain_type {
        DomainType::FrostAdmin => Some(host_route(
            &domain.domain,
            reverse_proxy(
                vec![format!("localhost:{}", options.admin_ui_port)],
                domain.request_timeout,
            ),
        )),
        DomainType::Proxy => {
            let service = upstreams.get(domain.service_id.as_deref()?)?;
            if service.ports.is_empty() {
                return None;
            }
            let dials = service
                .ports
                .iter()
                .map(|port| format!("127.0.0.1:{}", port))
                .collect();
            Some(host_route(
                &domain.domain,
                reverse_proxy(dials, domain.request_timeout.or(service.request_timeout)),
            ))
        }
        DomainType::Redirect => {
            let target = domain.redirect_target.as_ref()?;
            let mut headers = BTreeMap::new();
            headers.insert("Location".to_string(), vec![target.clone()]);
            Some(host_route(
                &domain.domain,
                Handler::StaticResponse {
                    headers,
                    status_code: domain.redirect_code.unwrap_or(Domain::DEFAULT_REDIRECT_CODE),
                },
            ))
        }
    }
}

/// Build the full routing document
///
/// Only DNS-verified domains are routed. A proxy domain whose service has no
/// running replicas gets no route.
pub fn build_document(
    options: &DocumentOptions,
    domains: &[Domain],
    upstreams: &HashMap<String, ServiceUpstreams>,
) -> CaddyConfig {
    let mut verified: Vec<&Domain> = domains.iter().filter(|d| d.dns_verified).collect();
    verified.sort_by(|a, b| a.domain.cmp(&b.domain));

    let mut routes = Vec::with_capacity(verified.len());
    for domain in verified {
        match domain_route(domain, options, upstreams) {
            Some(route) => routes.push(route),
            None => debug!("No route for {}: nothing to serve", domain.domain),
        }
    }

    let mut servers = BTreeMap::new();
    servers.insert(
        SERVER_NAME.to_string(),
        Server {
            listen: options.listen.clone(),
            routes,
        },
    );

    let tls = options.acme_email.as_ref().map(|email| TlsApp {
        automation: TlsAutomation {
            policies: vec![TlsPolicy {
                issuers: vec![AcmeIssuer {
                    module: "acme".to_string(),
                    email: email.clone(),
                }],
            }],
        },
    });

    CaddyConfig {
        admin: options.admin_listen.as_ref().map(|listen| AdminConfig {
            listen: listen.clone(),
        }),
        apps: Apps {
            http: HttpApp { servers },
            tls,
        },
    }
}
