use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::webhook::{Webhook, WebhookKind};

/// Read side of a webhook configuration collection.
pub trait WebhookSource: Send + Sync {
    /// The merged webhook list. Empty until the first sync.
    fn webhooks(&self) -> Arc<Vec<Arc<Webhook>>>;
    fn has_synced(&self) -> bool;
}

/// A configuration object holding an ordered list of webhooks.
pub trait WebhookConfiguration: Clone + Send + Sync + 'static {
    const KIND: WebhookKind;

    fn configuration_name(&self) -> &str;
    fn to_webhooks(&self) -> Vec<Webhook>;
}

impl WebhookConfiguration for MutatingWebhookConfiguration {
    const KIND: WebhookKind = WebhookKind::Mutating;

    fn configuration_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn to_webhooks(&self) -> Vec<Webhook> {
        let name = self.configuration_name();
        self.webhooks
            .iter()
            .flatten()
            .enumerate()
            .map(|(index, hook)| Webhook::from_mutating(name, index, hook))
            .collect()
    }
}

impl WebhookConfiguration for ValidatingWebhookConfiguration {
    const KIND: WebhookKind = WebhookKind::Validating;

    fn configuration_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn to_webhooks(&self) -> Vec<Webhook> {
        let name = self.configuration_name();
        self.webhooks
            .iter()
            .flatten()
            .enumerate()
            .map(|(index, hook)| Webhook::from_validating(name, index, hook))
            .collect()
    }
}

/// Holds the merged snapshot of one configuration kind. Writers replace the
/// snapshot wholesale; readers load it without locking.
pub struct ConfigurationManager<K> {
    snapshot: ArcSwap<Vec<Arc<Webhook>>>,
    synced: AtomicBool,
    _kind: PhantomData<fn() -> K>,
}

impl<K: WebhookConfiguration> Default for ConfigurationManager<K> {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            synced: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }
}

impl<K: WebhookConfiguration> ConfigurationManager<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the webhooks of `configurations`, ordered by configuration
    /// name and then by declaration order within each configuration.
    pub fn rebuild(&self, configurations: impl IntoIterator<Item = K>) {
        let mut configurations: Vec<K> = configurations.into_iter().collect();
        configurations.sort_by(|a, b| a.configuration_name().cmp(b.configuration_name()));

        let webhooks: Vec<Arc<Webhook>> = configurations
            .iter()
            .flat_map(|cfg| cfg.to_webhooks())
            .map(Arc::new)
            .collect();

        debug!(
            kind = K::KIND.as_str(),
            configurations = configurations.len(),
            webhooks = webhooks.len(),
            "rebuilt webhook configuration snapshot"
        );
        self.snapshot.store(Arc::new(webhooks));
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

impl<K: WebhookConfiguration> WebhookSource for ConfigurationManager<K> {
    fn webhooks(&self) -> Arc<Vec<Arc<Webhook>>> {
        self.snapshot.load_full()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// Keeps `manager` in step with the cluster's configuration objects of kind
/// `K`. Every watch event re-publishes the full list from the reflector store.
pub async fn run_cluster_source<K>(client: Client, manager: Arc<ConfigurationManager<K>>)
where
    K: WebhookConfiguration + Resource<DynamicType = ()> + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    futures::pin_mut!(stream);

    info!(kind = K::KIND.as_str(), "watching webhook configurations");
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::InitDone) => {
                manager.rebuild(snapshot_of(&reader));
                if !manager.has_synced() {
                    info!(kind = K::KIND.as_str(), "webhook configurations synced");
                }
                manager.mark_synced();
            }
            Ok(watcher::Event::Apply(_) | watcher::Event::Delete(_)) => {
                manager.rebuild(snapshot_of(&reader));
            }
            Ok(_) => {}
            Err(e) => warn!(kind = K::KIND.as_str(), "webhook configuration watch failed: {e}"),
        }
    }
}

fn snapshot_of<K>(store: &Store<K>) -> Vec<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.state().iter().map(|k| k.as_ref().clone()).collect()
}

/// Starts a namespace reflector. The returned store answers namespace label
/// lookups once the future is being polled.
pub fn namespace_reflector(client: Client) -> (Store<Namespace>, impl Future<Output = ()>) {
    let api: Api<Namespace> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    let driver = async move {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                warn!("namespace watch failed: {e}");
            }
        }
    };
    (reader, driver)
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Webhook configurations parsed from a multi-document YAML manifest.
#[derive(Debug, Default)]
pub struct ConfigurationManifest {
    pub mutating: Vec<MutatingWebhookConfiguration>,
    pub validating: Vec<ValidatingWebhookConfiguration>,
}

impl ConfigurationManifest {
    pub fn parse(path: &Path, contents: &str) -> Result<Self, SourceError> {
        let yaml_err = |source| SourceError::Yaml {
            path: path.to_path_buf(),
            source,
        };

        let mut manifest = Self::default();
        for document in serde_yaml::Deserializer::from_str(contents) {
            let value = serde_yaml::Value::deserialize(document).map_err(yaml_err)?;
            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
            match kind {
                "MutatingWebhookConfiguration" => manifest
                    .mutating
                    .push(serde_yaml::from_value(value).map_err(yaml_err)?),
                "ValidatingWebhookConfiguration" => manifest
                    .validating
                    .push(serde_yaml::from_value(value).map_err(yaml_err)?),
                "" if value.is_null() => {}
                other => debug!(kind = other, "skipping document in webhook manifest"),
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }
}

/// Re-reads the manifest at `path` every `interval` and republishes both
/// snapshots. A manifest that fails to load leaves the previous snapshots in
/// place.
pub async fn run_file_source(
    path: PathBuf,
    interval: Duration,
    mutating: Arc<ConfigurationManager<MutatingWebhookConfiguration>>,
    validating: Arc<ConfigurationManager<ValidatingWebhookConfiguration>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }

        match ConfigurationManifest::load(&path) {
            Ok(manifest) => {
                mutating.rebuild(manifest.mutating);
                validating.rebuild(manifest.validating);
                if !mutating.has_synced() {
                    info!(path = %path.display(), "webhook configurations loaded");
                }
                mutating.mark_synced();
                validating.mark_synced();
            }
            Err(e) => warn!("keeping previous webhook configurations: {e}"),
        }
    }
}
