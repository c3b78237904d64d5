pub mod resolver;
pub mod rest;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use hyper::Uri;
use lru::LruCache;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::tls::{TlsError, client_tls_config};

pub use resolver::{
    ANY_HOST, AuthenticationInfo, AuthenticationInfoResolver, DnsServiceResolver,
    ServiceEndpoint, ServiceResolver, StaticAuthenticationInfoResolver,
};
pub use rest::RestClient;
use rest::Target;

pub const DEFAULT_CACHE_SIZE: usize = 200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceConfig {
    pub name: String,
    pub namespace: String,
    pub path: String,
    pub port: i32,
}

/// Connection parameters of one webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Webhook name, used in errors only.
    pub name: String,
    pub url: Option<String>,
    pub service: Option<ServiceConfig>,
    pub ca_bundle: Vec<u8>,
}

/// Everything in a [`ClientConfig`] that affects the connection. The name is
/// left out so webhooks with identical endpoints share a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    url: Option<String>,
    service: Option<ServiceConfig>,
    ca_bundle: Vec<u8>,
}

impl From<&ClientConfig> for CacheKey {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.url.clone(),
            service: config.service.clone(),
            ca_bundle: config.ca_bundle.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("webhook configuration must have either service or URL")]
    NeedServiceOrUrl,
    #[error("invalid webhook URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("unable to resolve authentication info for {host}: {reason}")]
    Authentication { host: String, reason: String },
    #[error("unable to resolve service {service}: {reason}")]
    Resolve { service: String, reason: String },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("dial {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("TLS handshake with {authority}: {source}")]
    Handshake {
        authority: String,
        source: std::io::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error("the server responded with status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("request did not complete within {0:?}")]
    Timeout(Duration),
    #[error("unable to encode request: {0}")]
    Encode(serde_json::Error),
    #[error("unable to decode response: {0}")]
    Decode(serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the client manager requires {}", .missing.join(" and "))]
pub struct ClientManagerError {
    pub missing: Vec<&'static str>,
}

/// Builds and caches webhook clients.
pub struct ClientManager {
    cache: Mutex<LruCache<CacheKey, Arc<RestClient>>>,
    authentication_info_resolver: Option<Arc<dyn AuthenticationInfoResolver>>,
    service_resolver: Option<Arc<dyn ServiceResolver>>,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl ClientManager {
    /// A zero `cache_size` falls back to [`DEFAULT_CACHE_SIZE`].
    pub fn new(cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            authentication_info_resolver: None,
            service_resolver: None,
        }
    }

    pub fn with_authentication_info_resolver(
        mut self,
        resolver: Arc<dyn AuthenticationInfoResolver>,
    ) -> Self {
        self.authentication_info_resolver = Some(resolver);
        self
    }

    pub fn with_service_resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.service_resolver = Some(resolver);
        self
    }

    /// Checks that every collaborator needed to build clients is present.
    pub fn validate(&self) -> Result<(), ClientManagerError> {
        let mut missing = Vec::new();
        if self.service_resolver.is_none() {
            missing.push("a service resolver");
        }
        if self.authentication_info_resolver.is_none() {
            missing.push("an authentication info resolver");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClientManagerError { missing })
        }
    }

    pub fn cached_clients(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns the client for `config`, building it on a cache miss.
    pub fn hook_client(&self, config: &ClientConfig) -> Result<Arc<RestClient>, ClientError> {
        let key = CacheKey::from(config);
        let mut cache = self.cache.lock();
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }

        let client = Arc::new(self.build(config)?);
        debug!(webhook = %config.name, authority = %client.authority(), "built webhook client");
        cache.put(key, client.clone());
        Ok(client)
    }

    fn build(&self, config: &ClientConfig) -> Result<RestClient, ClientError> {
        let auth_resolver = self
            .authentication_info_resolver
            .as_ref()
            .ok_or(ClientError::NotConfigured("authentication info resolver"))?;

        if let Some(service) = &config.service {
            let resolver = self
                .service_resolver
                .as_ref()
                .ok_or(ClientError::NotConfigured("service resolver"))?;
            let auth = auth_resolver.client_config_for_service(
                &service.name,
                &service.namespace,
                service.port,
            )?;
            let host = format!("{}.{}.svc", service.name, service.namespace);
            let server_name = auth.server_name.clone().unwrap_or_else(|| host.clone());
            let tls = tls_target(&auth, &config.ca_bundle, server_name)?;
            return Ok(RestClient::new(
                Target::Service {
                    service: service.clone(),
                    resolver: resolver.clone(),
                },
                format!("{host}:{}", service.port),
                service.path.clone(),
                Some(tls),
                auth.bearer_token,
            ));
        }

        let Some(url) = &config.url else {
            return Err(ClientError::NeedServiceOrUrl);
        };
        let invalid = |reason: &str| ClientError::InvalidUrl {
            url: url.clone(),
            reason: reason.to_string(),
        };
        let uri = url.parse::<Uri>().map_err(|e| invalid(&e.to_string()))?;
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be https or http")),
        };
        let host = uri
            .host()
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| invalid("missing host"))?;

        let auth = auth_resolver.client_config_for(&authority)?;
        let tls = if https {
            let server_name = auth.server_name.clone().unwrap_or_else(|| host.clone());
            Some(tls_target(&auth, &config.ca_bundle, server_name)?)
        } else {
            None
        };

        Ok(RestClient::new(
            Target::Address { host, port },
            authority,
            uri.path().to_string(),
            tls,
            auth.bearer_token,
        ))
    }
}

fn tls_target(
    auth: &AuthenticationInfo,
    ca_bundle: &[u8],
    server_name: String,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let tls = client_tls_config(&[&auth.ca_data, ca_bundle], auth.client_identity.as_ref())?;
    let name = ServerName::try_from(server_name.clone()).map_err(|e| ClientError::InvalidUrl {
        url: server_name,
        reason: e.to_string(),
    })?;
    Ok((TlsConnector::from(tls), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ClientManager {
        ClientManager::new(DEFAULT_CACHE_SIZE)
            .with_authentication_info_resolver(Arc::new(StaticAuthenticationInfoResolver::default()))
            .with_service_resolver(Arc::new(DnsServiceResolver))
    }

    fn url_config(name: &str, url: &str) -> ClientConfig {
        ClientConfig {
            name: name.to_string(),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_config_different_name_shares_client() {
        let manager = manager();
        let a = manager
            .hook_client(&url_config("a.example.com", "http://127.0.0.1:8080/hook"))
            .unwrap();
        let b = manager
            .hook_client(&url_config("b.example.com", "http://127.0.0.1:8080/hook"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.cached_clients(), 1);

        let c = manager
            .hook_client(&url_config("a.example.com", "http://127.0.0.1:8080/other"))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.cached_clients(), 2);
    }

    #[test]
    fn test_cache_is_bounded() {
        let manager = ClientManager::new(2)
            .with_authentication_info_resolver(Arc::new(StaticAuthenticationInfoResolver::default()))
            .with_service_resolver(Arc::new(DnsServiceResolver));
        for port in 8000..8005 {
            manager
                .hook_client(&url_config("hook", &format!("http://127.0.0.1:{port}/")))
                .unwrap();
        }
        assert_eq!(manager.cached_clients(), 2);
    }

    #[test]
    fn test_service_client() {
        let manager = manager();
        let client = manager
            .hook_client(&ClientConfig {
                name: "hook".to_string(),
                service: Some(ServiceConfig {
                    name: "policy".to_string(),
                    namespace: "system".to_string(),
                    path: "/validate".to_string(),
                    port: 443,
                }),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(client.authority(), "policy.system.svc:443");
        assert_eq!(client.path(), "/validate");
    }

    #[test]
    fn test_url_client() {
        let manager = manager();
        let client = manager
            .hook_client(&url_config("hook", "https://hooks.example.com:9443/admit"))
            .unwrap();
        assert_eq!(client.authority(), "hooks.example.com:9443");
        assert_eq!(client.path(), "/admit");
    }

    #[test]
    fn test_invalid_configs() {
        let manager = manager();
        let err = manager
            .hook_client(&ClientConfig {
                name: "hook".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::NeedServiceOrUrl));

        let err = manager
            .hook_client(&url_config("hook", "ftp://hooks.example.com/"))
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl { .. }));

        let err = manager
            .hook_client(&ClientConfig {
                ca_bundle: b"garbage".to_vec(),
                ..url_config("hook", "https://hooks.example.com/")
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Tls(_)));
        assert_eq!(manager.cached_clients(), 0);
    }

    #[test]
    fn test_validate_reports_missing_collaborators() {
        let err = ClientManager::new(10).validate().unwrap_err();
        assert_eq!(err.missing.len(), 2);
        assert!(err.to_string().contains("service resolver"));
        assert!(manager().validate().is_ok());

        let err = ClientManager::new(10)
            .hook_client(&url_config("hook", "http://127.0.0.1:1/"))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConfigured(_)));
    }
}
