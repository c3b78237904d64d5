use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;

use crate::attributes::Operation;
use crate::schema::GroupVersionResource;

const WILDCARD: &str = "*";
const SCOPE_CLUSTER: &str = "Cluster";
const SCOPE_NAMESPACED: &str = "Namespaced";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    pub operations: Vec<String>,
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    /// `resource` or `resource/subresource`, either part may be `*`.
    pub resources: Vec<String>,
    /// `None` and `*` both mean any scope.
    pub scope: Option<String>,
}

impl Rule {
    pub fn new(operations: &[&str], groups: &[&str], versions: &[&str], resources: &[&str]) -> Self {
        Self {
            operations: owned(operations),
            api_groups: owned(groups),
            api_versions: owned(versions),
            resources: owned(resources),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }
}

impl From<&RuleWithOperations> for Rule {
    fn from(rule: &RuleWithOperations) -> Self {
        Self {
            operations: rule.operations.clone().unwrap_or_default(),
            api_groups: rule.api_groups.clone().unwrap_or_default(),
            api_versions: rule.api_versions.clone().unwrap_or_default(),
            resources: rule.resources.clone().unwrap_or_default(),
            scope: rule.scope.clone(),
        }
    }
}

/// The request facts a rule is tested against. The resource is borrowed
/// separately from the request so equivalent resources can be substituted.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub operation: Operation,
    pub resource: &'a GroupVersionResource,
    pub subresource: &'a str,
    pub namespace: &'a str,
}

impl Rule {
    pub fn matches(&self, input: &RuleInput<'_>) -> bool {
        self.scope_matches(input)
            && exact_or_wildcard(&self.operations, input.operation.as_str())
            && exact_or_wildcard(&self.api_groups, &input.resource.group)
            && exact_or_wildcard(&self.api_versions, &input.resource.version)
            && self.resource_matches(input)
    }

    fn resource_matches(&self, input: &RuleInput<'_>) -> bool {
        self.resources.iter().any(|entry| {
            let (resource, subresource) = match entry.split_once('/') {
                Some((res, sub)) => (res, sub),
                None => (entry.as_str(), ""),
            };
            (resource == WILDCARD || resource == input.resource.resource)
                && (subresource == WILDCARD || subresource == input.subresource)
        })
    }

    fn scope_matches(&self, input: &RuleInput<'_>) -> bool {
        let is_namespace_resource = is_namespace_resource(input.resource);
        match self.scope.as_deref() {
            None | Some(WILDCARD) => true,
            Some(SCOPE_NAMESPACED) => !is_namespace_resource && !input.namespace.is_empty(),
            Some(SCOPE_CLUSTER) => is_namespace_resource || input.namespace.is_empty(),
            Some(_) => false,
        }
    }
}

pub(crate) fn is_namespace_resource(resource: &GroupVersionResource) -> bool {
    resource.group.is_empty() && resource.version == "v1" && resource.resource == "namespaces"
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn exact_or_wildcard(items: &[String], requested: &str) -> bool {
    items.iter().any(|item| item == WILDCARD || item == requested)
}
