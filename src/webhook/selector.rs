use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::core::DynamicObject;
use kube::runtime::reflector::{ObjectRef, Store};
use parking_lot::RwLock;
use thiserror::Error;

use crate::attributes::{Attributes, Operation};
use crate::errors::StatusError;
use crate::webhook::Webhook;
use crate::webhook::rules::is_namespace_resource;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("{0:?} is not a valid label selector operator")]
    InvalidOperator(String),
    #[error("values: must be specified when `operator` is 'In' or 'NotIn' (key {0:?})")]
    MissingValues(String),
    #[error("values: may not be specified when `operator` is 'Exists' or 'DoesNotExist' (key {0:?})")]
    UnexpectedValues(String),
}

/// Source of namespace labels, normally an informer cache.
pub trait NamespaceLister: Send + Sync {
    /// `None` when the namespace does not exist.
    fn namespace_labels(&self, name: &str) -> Option<Labels>;
}

impl NamespaceLister for Store<Namespace> {
    fn namespace_labels(&self, name: &str) -> Option<Labels> {
        self.get(&ObjectRef::new(name))
            .map(|ns| ns.metadata.labels.clone().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct StaticNamespaceLister {
    namespaces: RwLock<HashMap<String, Labels>>,
}

impl StaticNamespaceLister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_labels(&self, namespace: &str, labels: Labels) {
        self.namespaces.write().insert(namespace.to_string(), labels);
    }
}

impl NamespaceLister for StaticNamespaceLister {
    fn namespace_labels(&self, name: &str) -> Option<Labels> {
        self.namespaces.read().get(name).cloned()
    }
}

pub fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|l| l.is_empty())
        && selector.match_expressions.as_ref().is_none_or(|e| e.is_empty())
}

/// Evaluates a label selector. The whole selector is validated first so an
/// invalid selector fails regardless of the labels presented.
pub fn selector_matches(selector: &LabelSelector, labels: &Labels) -> Result<bool, SelectorError> {
    let expressions = selector.match_expressions.as_deref().unwrap_or_default();
    for requirement in expressions {
        validate_requirement(requirement)?;
    }

    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));

    Ok(labels_match && expressions.iter().all(|r| requirement_matches(r, labels)))
}

fn validate_requirement(requirement: &LabelSelectorRequirement) -> Result<(), SelectorError> {
    let has_values = requirement.values.as_ref().is_some_and(|v| !v.is_empty());
    match requirement.operator.as_str() {
        "In" | "NotIn" if !has_values => Err(SelectorError::MissingValues(requirement.key.clone())),
        "Exists" | "DoesNotExist" if has_values => {
            Err(SelectorError::UnexpectedValues(requirement.key.clone()))
        }
        "In" | "NotIn" | "Exists" | "DoesNotExist" => Ok(()),
        other => Err(SelectorError::InvalidOperator(other.to_string())),
    }
}

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &Labels) -> bool {
    let value = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.is_none_or(|v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

fn object_labels(object: &DynamicObject) -> Labels {
    object.metadata.labels.clone().unwrap_or_default()
}

/// Decides whether the request's namespace satisfies the webhook's
/// namespace selector.
pub fn match_namespace_selector(
    hook: &Webhook,
    attrs: &Attributes,
    lister: &dyn NamespaceLister,
) -> Result<bool, StatusError> {
    let namespace_request = is_namespace_resource(&attrs.resource);
    if attrs.namespace.is_empty() && !namespace_request {
        // cluster-scoped resources other than namespaces always match
        return Ok(true);
    }
    let Some(selector) = hook.namespace_selector.as_ref() else {
        return Ok(true);
    };
    if selector_is_empty(selector) {
        return Ok(true);
    }

    let labels = if namespace_request
        && attrs.subresource.is_empty()
        && matches!(attrs.operation, Operation::Create | Operation::Update)
    {
        attrs.object.as_ref().map(object_labels).unwrap_or_default()
    } else {
        let name = if namespace_request && attrs.namespace.is_empty() {
            attrs.name.as_str()
        } else {
            attrs.namespace.as_str()
        };
        lister
            .namespace_labels(name)
            .ok_or_else(|| StatusError::not_found("namespaces", name))?
    };

    selector_matches(selector, &labels).map_err(StatusError::internal)
}

/// Decides whether the object (or, failing that, the old object) satisfies
/// the webhook's object selector.
pub fn match_object_selector(hook: &Webhook, attrs: &Attributes) -> Result<bool, StatusError> {
    let Some(selector) = hook.object_selector.as_ref() else {
        return Ok(true);
    };
    if selector_is_empty(selector) {
        return Ok(true);
    }
    let matches = |object: Option<&DynamicObject>| -> Result<bool, StatusError> {
        match object {
            Some(object) => selector_matches(selector, &object_labels(object))
                .map_err(StatusError::internal),
            None => Ok(false),
        }
    };
    Ok(matches(attrs.object.as_ref())? || matches(attrs.old_object.as_ref())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GroupVersionKind, GroupVersionResource};
    use crate::webhook::WebhookKind;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    fn labeled_object(pairs: &[(&str, &str)]) -> DynamicObject {
        let mut object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web"}
        }))
        .unwrap();
        object.metadata.labels = Some(labels(pairs));
        object
    }

    fn pod_attributes(namespace: &str) -> Attributes {
        Attributes::new(
            "uid",
            GroupVersionKind::new("", "v1", "Pod"),
            GroupVersionResource::new("", "v1", "pods"),
            Operation::Create,
        )
        .with_name(namespace, "web")
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: None,
        };
        assert!(selector_matches(&selector, &labels(&[("env", "prod"), ("x", "y")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[("env", "dev")])).unwrap());
        assert!(!selector_matches(&selector, &Labels::new()).unwrap());
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("tier", "In", &["frontend", "backend"]),
                requirement("legacy", "DoesNotExist", &[]),
                requirement("env", "NotIn", &["dev"]),
            ]),
        };
        assert!(selector_matches(&selector, &labels(&[("tier", "frontend")])).unwrap());
        assert!(!selector_matches(&selector, &labels(&[("tier", "db")])).unwrap());
        assert!(
            !selector_matches(&selector, &labels(&[("tier", "backend"), ("legacy", "1")]))
                .unwrap()
        );
        assert!(
            !selector_matches(&selector, &labels(&[("tier", "backend"), ("env", "dev")])).unwrap()
        );
    }

    #[test]
    fn test_invalid_selectors() {
        let bad_operator = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("a", "Near", &["b"])]),
        };
        assert_eq!(
            selector_matches(&bad_operator, &Labels::new()),
            Err(SelectorError::InvalidOperator("Near".to_string()))
        );

        let missing_values = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("a", "In", &[])]),
        };
        assert!(matches!(
            selector_matches(&missing_values, &Labels::new()),
            Err(SelectorError::MissingValues(_))
        ));
    }

    #[test]
    fn test_namespace_selector_uses_lister() {
        let lister = StaticNamespaceLister::new();
        lister.set_labels("prod", labels(&[("env", "prod")]));
        lister.set_labels("dev", labels(&[("env", "dev")]));

        let mut hook = Webhook::new("hook", WebhookKind::Validating);
        hook.namespace_selector = Some(LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: None,
        });

        assert!(match_namespace_selector(&hook, &pod_attributes("prod"), &lister).unwrap());
        assert!(!match_namespace_selector(&hook, &pod_attributes("dev"), &lister).unwrap());

        let err = match_namespace_selector(&hook, &pod_attributes("missing"), &lister).unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[test]
    fn test_namespace_selector_cluster_scoped_always_matches() {
        let lister = StaticNamespaceLister::new();
        let mut hook = Webhook::new("hook", WebhookKind::Validating);
        hook.namespace_selector = Some(LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: None,
        });
        let attrs = Attributes::new(
            "uid",
            GroupVersionKind::new("", "v1", "Node"),
            GroupVersionResource::new("", "v1", "nodes"),
            Operation::Create,
        )
        .with_name("", "node-1");
        assert!(match_namespace_selector(&hook, &attrs, &lister).unwrap());
    }

    #[test]
    fn test_namespace_selector_for_namespace_create_uses_object() {
        let lister = StaticNamespaceLister::new();
        let mut hook = Webhook::new("hook", WebhookKind::Validating);
        hook.namespace_selector = Some(LabelSelector {
            match_labels: Some(labels(&[("env", "prod")])),
            match_expressions: None,
        });
        let attrs = Attributes::new(
            "uid",
            GroupVersionKind::new("", "v1", "Namespace"),
            GroupVersionResource::new("", "v1", "namespaces"),
            Operation::Create,
        )
        .with_name("team-a", "team-a")
        .with_object(labeled_object(&[("env", "prod")]));
        assert!(match_namespace_selector(&hook, &attrs, &lister).unwrap());
    }

    #[test]
    fn test_object_selector_checks_old_object() {
        let mut hook = Webhook::new("hook", WebhookKind::Mutating);
        hook.object_selector = Some(LabelSelector {
            match_labels: Some(labels(&[("inject", "true")])),
            match_expressions: None,
        });

        let attrs = pod_attributes("default").with_object(labeled_object(&[("inject", "true")]));
        assert!(match_object_selector(&hook, &attrs).unwrap());

        let attrs = pod_attributes("default")
            .with_object(labeled_object(&[]))
            .with_old_object(labeled_object(&[("inject", "true")]));
        assert!(match_object_selector(&hook, &attrs).unwrap());

        let attrs = pod_attributes("default").with_object(labeled_object(&[("inject", "no")]));
        assert!(!match_object_selector(&hook, &attrs).unwrap());

        hook.object_selector = Some(LabelSelector::default());
        assert!(match_object_selector(&hook, &attrs).unwrap());
    }
}
