use std::sync::Arc;

use crate::attributes::Attributes;
use crate::errors::StatusError;
use crate::object::ObjectInterfaces;
use crate::schema::{GroupVersionKind, GroupVersionResource};
use crate::webhook::rules::RuleInput;
use crate::webhook::selector::{NamespaceLister, match_namespace_selector, match_object_selector};
use crate::webhook::{MatchPolicy, Webhook};

/// A webhook that applies to a request, along with the resource and kind the
/// webhook should see. Those differ from the request's own when the match
/// came through an equivalent resource.
#[derive(Debug, Clone)]
pub struct WebhookInvocation {
    pub webhook: Arc<Webhook>,
    pub resource: GroupVersionResource,
    pub subresource: String,
    pub kind: GroupVersionKind,
}

/// Decides whether `hook` must be called for `attrs`.
///
/// Rules are first tried against the request's own resource. If none match
/// and the webhook uses the `Equivalent` match policy, the rules are tried
/// again in declaration order against each equivalent resource; the first
/// rule to match any of them wins. Selector errors only surface for webhooks
/// whose rules match.
pub fn should_call_hook(
    hook: &Arc<Webhook>,
    attrs: &Attributes,
    objects: &dyn ObjectInterfaces,
    namespaces: &dyn NamespaceLister,
) -> Result<Option<WebhookInvocation>, StatusError> {
    let namespace_match = match_namespace_selector(hook, attrs, namespaces);
    if let Ok(false) = namespace_match {
        return Ok(None);
    }
    let object_match = match_object_selector(hook, attrs);
    if let Ok(false) = object_match {
        return Ok(None);
    }

    let Some(invocation) = match_rules(hook, attrs, objects)? else {
        return Ok(None);
    };

    namespace_match?;
    object_match?;
    Ok(Some(invocation))
}

fn match_rules(
    hook: &Arc<Webhook>,
    attrs: &Attributes,
    objects: &dyn ObjectInterfaces,
) -> Result<Option<WebhookInvocation>, StatusError> {
    let input = RuleInput {
        operation: attrs.operation,
        resource: &attrs.resource,
        subresource: &attrs.subresource,
        namespace: &attrs.namespace,
    };
    if hook.rules.iter().any(|rule| rule.matches(&input)) {
        return Ok(Some(WebhookInvocation {
            webhook: hook.clone(),
            resource: attrs.resource.clone(),
            subresource: attrs.subresource.clone(),
            kind: attrs.kind.clone(),
        }));
    }

    if hook.match_policy != MatchPolicy::Equivalent {
        return Ok(None);
    }

    let mapper = objects.equivalent_resource_mapper();
    let equivalents: Vec<GroupVersionResource> = mapper
        .equivalent_resources_for(&attrs.resource, &attrs.subresource)
        .into_iter()
        .filter(|equivalent| *equivalent != attrs.resource)
        .collect();

    for rule in &hook.rules {
        for equivalent in &equivalents {
            let input = RuleInput {
                resource: equivalent,
                ..input
            };
            if !rule.matches(&input) {
                continue;
            }
            let kind = mapper
                .kind_for(equivalent, &attrs.subresource)
                .filter(|kind| !kind.is_empty())
                .ok_or_else(|| {
                    StatusError::internal(format!("unable to convert to {equivalent}: unknown kind"))
                })?;
            return Ok(Some(WebhookInvocation {
                webhook: hook.clone(),
                resource: equivalent.clone(),
                subresource: attrs.subresource.clone(),
                kind,
            }));
        }
    }

    Ok(None)
}
