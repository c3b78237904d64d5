use std::collections::HashMap;
use std::fmt;

use crate::client::ClientError;
use crate::tls::ClientIdentity;

/// Wildcard key matching any host without a more specific entry.
pub const ANY_HOST: &str = "*";

/// Credentials and trust material used when calling one webhook host.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthenticationInfo {
    pub bearer_token: Option<String>,
    pub client_identity: Option<ClientIdentity>,
    /// Extra PEM roots; the webhook's own CA bundle is appended to these.
    pub ca_data: Vec<u8>,
    pub server_name: Option<String>,
}

impl fmt::Debug for AuthenticationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationInfo")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("client_identity", &self.client_identity)
            .field("ca_data", &self.ca_data.len())
            .field("server_name", &self.server_name)
            .finish()
    }
}

pub trait AuthenticationInfoResolver: Send + Sync {
    /// `host_port` is the authority of a webhook URL.
    fn client_config_for(&self, host_port: &str) -> Result<AuthenticationInfo, ClientError>;

    fn client_config_for_service(
        &self,
        name: &str,
        namespace: &str,
        port: i32,
    ) -> Result<AuthenticationInfo, ClientError>;
}

/// Authentication info keyed by host. Lookups try `host:port`, then `host`,
/// then [`ANY_HOST`]; hosts without any entry call anonymously.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticationInfoResolver {
    entries: HashMap<String, AuthenticationInfo>,
}

impl StaticAuthenticationInfoResolver {
    pub fn new(entries: HashMap<String, AuthenticationInfo>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, host: impl Into<String>, info: AuthenticationInfo) {
        self.entries.insert(host.into(), info);
    }

    fn lookup(&self, candidates: &[&str]) -> AuthenticationInfo {
        candidates
            .iter()
            .chain(std::iter::once(&ANY_HOST))
            .find_map(|key| self.entries.get(*key))
            .cloned()
            .unwrap_or_default()
    }
}

impl AuthenticationInfoResolver for StaticAuthenticationInfoResolver {
    fn client_config_for(&self, host_port: &str) -> Result<AuthenticationInfo, ClientError> {
        let host = split_host(host_port);
        Ok(self.lookup(&[host_port, host]))
    }

    fn client_config_for_service(
        &self,
        name: &str,
        namespace: &str,
        port: i32,
    ) -> Result<AuthenticationInfo, ClientError> {
        let host = format!("{name}.{namespace}.svc");
        let host_port = format!("{host}:{port}");
        Ok(self.lookup(&[host_port.as_str(), host.as_str()]))
    }
}

fn split_host(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        return rest.split_once(']').map_or(host_port, |(host, _)| host);
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => host_port,
    }
}

/// Where a service-backed webhook can be reached right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

/// Maps a service reference to a network endpoint. Consulted on every
/// connection so endpoint changes take effect without rebuilding clients.
pub trait ServiceResolver: Send + Sync {
    fn resolve_endpoint(
        &self,
        namespace: &str,
        name: &str,
        port: i32,
    ) -> Result<ServiceEndpoint, ClientError>;
}

/// Resolves services through cluster DNS as `<name>.<namespace>.svc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsServiceResolver;

impl ServiceResolver for DnsServiceResolver {
    fn resolve_endpoint(
        &self,
        namespace: &str,
        name: &str,
        port: i32,
    ) -> Result<ServiceEndpoint, ClientError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(ClientError::Resolve {
                service: format!("{namespace}/{name}"),
                reason: "service name and namespace are required".to_string(),
            });
        }
        let port = u16::try_from(port).map_err(|_| ClientError::Resolve {
            service: format!("{namespace}/{name}"),
            reason: format!("invalid port {port}"),
        })?;
        Ok(ServiceEndpoint {
            host: format!("{name}.{namespace}.svc"),
            port,
        })
    }
}
