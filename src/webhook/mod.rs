pub mod matcher;
pub mod rules;
pub mod selector;
pub mod source;

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, ValidatingWebhook, WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::client::{ClientConfig, ClientError, ClientManager, RestClient, ServiceConfig};

pub use matcher::{WebhookInvocation, should_call_hook};
pub use rules::Rule;

/// The only AdmissionReview version this crate speaks.
pub const ADMISSION_REVIEW_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookKind {
    Mutating,
    Validating,
}

impl WebhookKind {
    /// Label used for this kind in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookKind::Mutating => "admit",
            WebhookKind::Validating => "validating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    Ignore,
    #[default]
    Fail,
}

impl FailurePolicy {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Ignore") => FailurePolicy::Ignore,
            _ => FailurePolicy::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    Exact,
    #[default]
    Equivalent,
}

impl MatchPolicy {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Exact") => MatchPolicy::Exact,
            _ => MatchPolicy::Equivalent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectClass {
    Unknown,
    None,
    Some,
    NoneOnDryRun,
}

impl SideEffectClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Unknown" => Some(SideEffectClass::Unknown),
            "None" => Some(SideEffectClass::None),
            "Some" => Some(SideEffectClass::Some),
            "NoneOnDryRun" => Some(SideEffectClass::NoneOnDryRun),
            _ => None,
        }
    }

    pub fn supports_dry_run(self) -> bool {
        matches!(self, SideEffectClass::None | SideEffectClass::NoneOnDryRun)
    }
}

/// `MutatingWebhook` and `ValidatingWebhook` share every field read here
/// under the same names, but no common trait.
macro_rules! webhook_from {
    ($kind:expr, $configuration_name:expr, $index:expr, $hook:expr) => {{
        let (configuration_name, hook) = ($configuration_name, $hook);
        let mut webhook = Webhook::new(&hook.name, $kind).with_client_config(&hook.client_config);
        webhook.uid = format!("{configuration_name}/{}/{}", hook.name, $index);
        webhook.configuration_name = configuration_name.to_string();
        webhook.rules = hook.rules.iter().flatten().map(Rule::from).collect();
        webhook.failure_policy = FailurePolicy::parse(hook.failure_policy.as_deref());
        webhook.match_policy = MatchPolicy::parse(hook.match_policy.as_deref());
        webhook.namespace_selector = hook.namespace_selector.clone();
        webhook.object_selector = hook.object_selector.clone();
        webhook.side_effects = SideEffectClass::parse(&hook.side_effects);
        webhook.timeout = timeout_from_seconds(hook.timeout_seconds);
        webhook.admission_review_versions = hook.admission_review_versions.clone();
        webhook
    }};
}

/// One webhook out of the merged configuration snapshot.
#[derive(Clone)]
pub struct Webhook {
    /// `<configuration>/<webhook>/<index>`, unique within a snapshot.
    pub uid: String,
    pub configuration_name: String,
    pub name: String,
    pub kind: WebhookKind,
    pub rules: Vec<Rule>,
    pub failure_policy: FailurePolicy,
    pub match_policy: MatchPolicy,
    pub namespace_selector: Option<LabelSelector>,
    pub object_selector: Option<LabelSelector>,
    /// `None` when the configuration left the declaration out.
    pub side_effects: Option<SideEffectClass>,
    pub timeout: Option<Duration>,
    pub admission_review_versions: Vec<String>,
    pub client_config: ClientConfig,
    client: OnceLock<Arc<RestClient>>,
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rules", &self.rules)
            .field("failure_policy", &self.failure_policy)
            .field("match_policy", &self.match_policy)
            .field("side_effects", &self.side_effects)
            .field("timeout", &self.timeout)
            .field("client_config", &self.client_config)
            .finish_non_exhaustive()
    }
}

impl Webhook {
    pub fn new(name: &str, kind: WebhookKind) -> Self {
        Self {
            uid: name.to_string(),
            configuration_name: String::new(),
            name: name.to_string(),
            kind,
            rules: Vec::new(),
            failure_policy: FailurePolicy::Fail,
            match_policy: MatchPolicy::Equivalent,
            namespace_selector: None,
            object_selector: None,
            side_effects: Some(SideEffectClass::None),
            timeout: None,
            admission_review_versions: vec![ADMISSION_REVIEW_VERSION.to_string()],
            client_config: ClientConfig {
                name: name.to_string(),
                ..Default::default()
            },
            client: OnceLock::new(),
        }
    }

    pub fn from_mutating(configuration_name: &str, index: usize, hook: &MutatingWebhook) -> Self {
        webhook_from!(WebhookKind::Mutating, configuration_name, index, hook)
    }

    pub fn from_validating(
        configuration_name: &str,
        index: usize,
        hook: &ValidatingWebhook,
    ) -> Self {
        webhook_from!(WebhookKind::Validating, configuration_name, index, hook)
    }

    fn with_client_config(mut self, client_config: &WebhookClientConfig) -> Self {
        self.client_config = ClientConfig {
            name: self.name.clone(),
            url: client_config.url.clone(),
            service: client_config.service.as_ref().map(|svc| ServiceConfig {
                name: svc.name.clone(),
                namespace: svc.namespace.clone(),
                path: svc.path.clone().unwrap_or_default(),
                port: svc.port.unwrap_or(443),
            }),
            ca_bundle: client_config
                .ca_bundle
                .as_ref()
                .map(|b| b.0.clone())
                .unwrap_or_default(),
        };
        self
    }

    pub fn accepts_admission_review_version(&self) -> bool {
        self.admission_review_versions
            .iter()
            .any(|v| v == ADMISSION_REVIEW_VERSION)
    }

    /// Client for this webhook, built through the manager on first use and
    /// kept for the lifetime of this snapshot entry.
    pub fn rest_client(&self, manager: &ClientManager) -> Result<Arc<RestClient>, ClientError> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }
        let client = manager.hook_client(&self.client_config)?;
        Ok(self.client.get_or_init(|| client).clone())
    }
}

fn timeout_from_seconds(seconds: Option<i32>) -> Option<Duration> {
    seconds
        .filter(|s| *s > 0)
        .map(|s| Duration::from_secs(s as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use k8s_openapi::api::admissionregistration::v1::{RuleWithOperations, ServiceReference};

    fn mutating_hook() -> MutatingWebhook {
        MutatingWebhook {
            name: "inject.example.com".to_string(),
            admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
            side_effects: "NoneOnDryRun".to_string(),
            failure_policy: Some("Ignore".to_string()),
            match_policy: Some("Exact".to_string()),
            timeout_seconds: Some(5),
            client_config: WebhookClientConfig {
                ca_bundle: Some(ByteString(b"ca".to_vec())),
                service: Some(ServiceReference {
                    name: "injector".to_string(),
                    namespace: "system".to_string(),
                    path: Some("/mutate".to_string()),
                    port: None,
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string()]),
                api_groups: Some(vec!["".to_string()]),
                api_versions: Some(vec!["v1".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: None,
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_mutating_webhook() {
        let webhook = Webhook::from_mutating("injector-config", 2, &mutating_hook());
        assert_eq!(webhook.uid, "injector-config/inject.example.com/2");
        assert_eq!(webhook.kind, WebhookKind::Mutating);
        assert_eq!(webhook.failure_policy, FailurePolicy::Ignore);
        assert_eq!(webhook.match_policy, MatchPolicy::Exact);
        assert_eq!(webhook.side_effects, Some(SideEffectClass::NoneOnDryRun));
        assert_eq!(webhook.timeout, Some(Duration::from_secs(5)));
        assert_eq!(webhook.rules.len(), 1);
        assert!(webhook.accepts_admission_review_version());

        let service = webhook.client_config.service.unwrap();
        assert_eq!(service.port, 443);
        assert_eq!(service.path, "/mutate");
        assert_eq!(webhook.client_config.ca_bundle, b"ca".to_vec());
        assert_eq!(webhook.client_config.name, "inject.example.com");
    }

    #[test]
    fn test_mutating_and_validating_convert_alike() {
        let mutating = mutating_hook();
        let validating = ValidatingWebhook {
            name: mutating.name.clone(),
            admission_review_versions: mutating.admission_review_versions.clone(),
            side_effects: mutating.side_effects.clone(),
            failure_policy: mutating.failure_policy.clone(),
            match_policy: mutating.match_policy.clone(),
            timeout_seconds: mutating.timeout_seconds,
            client_config: mutating.client_config.clone(),
            rules: mutating.rules.clone(),
            namespace_selector: mutating.namespace_selector.clone(),
            object_selector: mutating.object_selector.clone(),
            ..Default::default()
        };

        let from_mutating = Webhook::from_mutating("cfg", 1, &mutating);
        let from_validating = Webhook::from_validating("cfg", 1, &validating);
        assert_eq!(from_validating.kind, WebhookKind::Validating);
        assert_eq!(from_mutating.uid, from_validating.uid);
        assert_eq!(from_mutating.rules, from_validating.rules);
        assert_eq!(from_mutating.failure_policy, from_validating.failure_policy);
        assert_eq!(from_mutating.match_policy, from_validating.match_policy);
        assert_eq!(from_mutating.side_effects, from_validating.side_effects);
        assert_eq!(from_mutating.timeout, from_validating.timeout);
        assert_eq!(from_mutating.client_config, from_validating.client_config);
    }

    #[test]
    fn test_defaults_for_unset_fields() {
        let hook = ValidatingWebhook {
            name: "check.example.com".to_string(),
            admission_review_versions: vec!["v1beta1".to_string()],
            ..Default::default()
        };
        let webhook = Webhook::from_validating("cfg", 0, &hook);
        assert_eq!(webhook.failure_policy, FailurePolicy::Fail);
        assert_eq!(webhook.match_policy, MatchPolicy::Equivalent);
        assert_eq!(webhook.side_effects, None);
        assert_eq!(webhook.timeout, None);
        assert!(webhook.rules.is_empty());
        assert!(!webhook.accepts_admission_review_version());
    }

    #[test]
    fn test_side_effects_dry_run_support() {
        assert!(SideEffectClass::None.supports_dry_run());
        assert!(SideEffectClass::NoneOnDryRun.supports_dry_run());
        assert!(!SideEffectClass::Some.supports_dry_run());
        assert!(!SideEffectClass::Unknown.supports_dry_run());
        assert_eq!(SideEffectClass::parse(""), None);
    }
}
