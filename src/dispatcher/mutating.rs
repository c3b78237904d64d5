use async_trait::async_trait;
use json_patch::Patch;
use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::attributes::Attributes;
use crate::dispatcher::policy::{self, Decision};
use crate::dispatcher::{Dispatcher, VersionedAttributes, WebhookCaller, invocation_annotation_key};
use crate::errors::{HookError, StatusError};
use crate::object::ObjectInterfaces;
use crate::webhook::WebhookInvocation;

const MUTATION_ANNOTATION_PREFIX: &str = "mutation.webhook.admission.k8s.io";

/// Metadata maps that serialize away when empty but that patches routinely
/// add keys into.
const METADATA_MAPS: [&str; 2] = ["labels", "annotations"];

#[derive(Serialize)]
struct MutationAnnotation<'a> {
    configuration: &'a str,
    webhook: &'a str,
    mutated: bool,
}

/// Calls mutating webhooks one after another, each seeing the object as
/// left by the previous one.
pub struct MutatingDispatcher {
    caller: WebhookCaller,
}

impl MutatingDispatcher {
    pub fn new(caller: WebhookCaller) -> Self {
        Self { caller }
    }

    async fn call_and_patch(
        &self,
        invocation: &WebhookInvocation,
        attrs: &Attributes,
        versioned: &mut VersionedAttributes,
        objects: &dyn ObjectInterfaces,
    ) -> Result<bool, HookError> {
        let hook = &invocation.webhook;
        let response = self.caller.call(invocation, attrs, versioned).await?;
        if !response.allowed {
            return Err(HookError::Rejected(StatusError::webhook_denied(
                &hook.name,
                response.result,
            )));
        }

        let patch_bytes = response.patch_bytes();
        if patch_bytes.is_empty() {
            return Ok(false);
        }
        let patch: Patch = serde_json::from_slice(patch_bytes).map_err(StatusError::internal)?;
        if patch.0.is_empty() {
            return Ok(false);
        }

        let Some(object) = versioned.object.as_ref() else {
            return Err(StatusError::internal(format!(
                "admission webhook \"{}\" attempted to modify the object, which is not supported for this operation",
                hook.name
            ))
            .into());
        };

        let mut document = serde_json::to_value(object).map_err(StatusError::internal)?;
        let filled = fill_metadata_maps(&mut document);
        json_patch::patch(&mut document, &patch.0).map_err(StatusError::internal)?;
        prune_metadata_maps(&mut document, &filled);
        let mut patched: DynamicObject =
            serde_json::from_value(document).map_err(StatusError::internal)?;
        objects.defaulter().apply_defaults(&mut patched);

        versioned.object = Some(patched);
        versioned.dirty = true;
        debug!(webhook = %hook.name, uid = %attrs.uid, "applied patch from webhook");
        Ok(true)
    }
}

/// Adds the missing metadata maps as empty objects and returns the ones added.
fn fill_metadata_maps(document: &mut Value) -> Vec<&'static str> {
    let Some(metadata) = document.get_mut("metadata").and_then(Value::as_object_mut) else {
        return Vec::new();
    };
    METADATA_MAPS
        .into_iter()
        .filter(|key| {
            let missing = !metadata.contains_key(*key);
            if missing {
                metadata.insert(key.to_string(), Value::Object(Map::new()));
            }
            missing
        })
        .collect()
}

/// Removes maps added by [`fill_metadata_maps`] that the patch left empty.
fn prune_metadata_maps(document: &mut Value, filled: &[&str]) {
    let Some(metadata) = document.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    for key in filled {
        if metadata
            .get(*key)
            .and_then(Value::as_object)
            .is_some_and(Map::is_empty)
        {
            metadata.remove(*key);
        }
    }
}

#[async_trait]
impl Dispatcher for MutatingDispatcher {
    async fn dispatch(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
        invocations: Vec<WebhookInvocation>,
    ) -> Result<(), StatusError> {
        let mut versioned: Option<VersionedAttributes> = None;

        for (index, invocation) in invocations.iter().enumerate() {
            let hook = &invocation.webhook;
            let current = match versioned.take() {
                Some(mut current) => {
                    current.convert_to(&invocation.kind, objects.convertor())?;
                    current
                }
                None => VersionedAttributes::new(attrs, &invocation.kind, objects.convertor())?,
            };
            let current = versioned.insert(current);

            match self.call_and_patch(invocation, attrs, current, objects).await {
                Ok(mutated) => {
                    let annotation = MutationAnnotation {
                        configuration: &hook.configuration_name,
                        webhook: &hook.name,
                        mutated,
                    };
                    let key = invocation_annotation_key(MUTATION_ANNOTATION_PREFIX, index);
                    match serde_json::to_string(&annotation) {
                        Ok(value) => {
                            if let Err(e) = attrs.add_annotation(&key, &value) {
                                warn!(webhook = %hook.name, "failed to record mutation annotation: {e}");
                            }
                        }
                        Err(e) => warn!(webhook = %hook.name, "failed to encode mutation annotation: {e}"),
                    }
                }
                Err(err) => match policy::evaluate(hook, index, attrs, err, self.caller.metrics()) {
                    Decision::Ignore => continue,
                    Decision::Abort(status) => return Err(status),
                },
            }
        }

        if let Some(versioned) = versioned.filter(|v| v.dirty) {
            if let Some(object) = versioned.object {
                let object = if versioned.kind == attrs.kind {
                    object
                } else {
                    objects
                        .convertor()
                        .convert_to_kind(&object, &attrs.kind)
                        .map_err(StatusError::internal)?
                };
                attrs.object = Some(object);
            }
        }
        Ok(())
    }
}
