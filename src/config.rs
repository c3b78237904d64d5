use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use webhook_admission::client::{AuthenticationInfo, DEFAULT_CACHE_SIZE, StaticAuthenticationInfoResolver};
use webhook_admission::object::EquivalentResourceRegistry;
use webhook_admission::schema::{GroupVersionKind, GroupVersionResource};
use webhook_admission::tls::ClientIdentity;
use webhook_admission::webhook::selector::{Labels, StaticNamespaceLister};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Webhook configurations read from a YAML manifest on disk.
    #[default]
    File,
    /// Webhook configurations watched from the cluster.
    Cluster,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("/etc/webhook-admission/webhooks.yaml")
}

fn default_reload_interval_seconds() -> u64 {
    30
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub client: ClientSettings,
    /// Groups of resources that are the same logical resource.
    #[serde(default)]
    pub equivalent_resources: Vec<Vec<EquivalentResource>>,
    /// Namespace labels used by namespace selectors when webhooks come from a
    /// file and no cluster is watched.
    #[serde(default)]
    pub namespaces: BTreeMap<String, Labels>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_manifest_path")]
    pub path: PathBuf,
    #[serde(default = "default_reload_interval_seconds")]
    pub reload_interval_seconds: u64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            path: default_manifest_path(),
            reload_interval_seconds: default_reload_interval_seconds(),
        }
    }
}

impl WebhooksConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    /// Keyed by `host`, `host:port` or `*`.
    #[serde(default)]
    pub auth: BTreeMap<String, AuthEntry>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            default_timeout_seconds: default_timeout_seconds(),
            ready_timeout_seconds: default_timeout_seconds(),
            auth: BTreeMap::new(),
        }
    }
}

impl ClientSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    pub token_file: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalentResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub subresource: String,
    pub kind: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("auth entry {host:?} sets only one of client_cert_path and client_key_path")]
    IncompleteIdentity { host: String },
}

fn read(path: &PathBuf) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })
}

impl AuthEntry {
    fn to_info(&self, host: &str) -> Result<AuthenticationInfo, ConfigError> {
        let bearer_token = match &self.token_file {
            Some(path) => Some(String::from_utf8_lossy(&read(path)?).trim().to_string()),
            None => None,
        };
        let client_identity = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some(ClientIdentity {
                cert_pem: read(cert)?,
                key_pem: read(key)?,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::IncompleteIdentity {
                    host: host.to_string(),
                });
            }
        };
        let ca_data = match &self.ca_path {
            Some(path) => read(path)?,
            None => Vec::new(),
        };
        Ok(AuthenticationInfo {
            bearer_token,
            client_identity,
            ca_data,
            server_name: self.server_name.clone(),
        })
    }
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("WEBHOOK_ADMISSION_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    pub fn authentication_resolver(&self) -> Result<StaticAuthenticationInfoResolver, ConfigError> {
        let entries = self
            .client
            .auth
            .iter()
            .map(|(host, entry)| Ok((host.clone(), entry.to_info(host)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        Ok(StaticAuthenticationInfoResolver::new(entries))
    }

    pub fn equivalent_resource_registry(&self) -> EquivalentResourceRegistry {
        let registry = EquivalentResourceRegistry::new();
        for (index, group) in self.equivalent_resources.iter().enumerate() {
            let identity = format!("equivalence-group-{index}");
            for member in group {
                registry.register(
                    &identity,
                    GroupVersionResource::new(&member.group, &member.version, &member.resource),
                    &member.subresource,
                    GroupVersionKind::new(&member.group, &member.version, &member.kind),
                );
            }
        }
        registry
    }

    pub fn namespace_lister(&self) -> StaticNamespaceLister {
        let lister = StaticNamespaceLister::new();
        for (name, labels) in &self.namespaces {
            lister.set_labels(name, labels.clone());
        }
        lister
    }
}
