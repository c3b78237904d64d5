use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use kube::core::{DynamicObject, TypeMeta};
use parking_lot::RwLock;
use thiserror::Error;

use crate::schema::{GroupVersionKind, GroupVersionResource};

#[derive(Debug, Error)]
#[error("unable to convert object to {target}: {reason}")]
pub struct ConversionError {
    pub target: GroupVersionKind,
    pub reason: String,
}

pub trait ObjectConvertor: Send + Sync {
    /// Returns a copy of `object` expressed as `kind`.
    fn convert_to_kind(
        &self,
        object: &DynamicObject,
        kind: &GroupVersionKind,
    ) -> Result<DynamicObject, ConversionError>;
}

pub trait ObjectDefaulter: Send + Sync {
    fn apply_defaults(&self, object: &mut DynamicObject);
}

/// Knows which resources are the same logical resource served under
/// different groups or versions, and which kind each of them uses.
pub trait EquivalentResourceMapper: Send + Sync {
    fn equivalent_resources_for(
        &self,
        resource: &GroupVersionResource,
        subresource: &str,
    ) -> Vec<GroupVersionResource>;

    fn kind_for(&self, resource: &GroupVersionResource, subresource: &str)
    -> Option<GroupVersionKind>;
}

pub trait ObjectInterfaces: Send + Sync {
    fn convertor(&self) -> &dyn ObjectConvertor;
    fn defaulter(&self) -> &dyn ObjectDefaulter;
    fn equivalent_resource_mapper(&self) -> &dyn EquivalentResourceMapper;
}

/// Converts by rewriting `apiVersion`/`kind`. Suitable when the schemas of the
/// equivalent versions are field-compatible, which is what unstructured
/// objects carried through a gateway can assume.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeMetaConvertor;

impl ObjectConvertor for TypeMetaConvertor {
    fn convert_to_kind(
        &self,
        object: &DynamicObject,
        kind: &GroupVersionKind,
    ) -> Result<DynamicObject, ConversionError> {
        if kind.kind.is_empty() || kind.version.is_empty() {
            return Err(ConversionError {
                target: kind.clone(),
                reason: "target kind is incomplete".to_string(),
            });
        }
        let mut out = object.clone();
        out.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });
        Ok(out)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDefaults;

impl ObjectDefaulter for NoDefaults {
    fn apply_defaults(&self, _object: &mut DynamicObject) {}
}

#[derive(Debug, Default)]
struct RegistryState {
    kinds: HashMap<(GroupVersionResource, String), GroupVersionKind>,
    identities: HashMap<GroupVersionResource, String>,
    members: HashMap<String, BTreeMap<String, BTreeSet<GroupVersionResource>>>,
}

/// In-memory [`EquivalentResourceMapper`]. Resources registered under the same
/// identity are equivalent to each other.
#[derive(Debug, Default)]
pub struct EquivalentResourceRegistry {
    state: RwLock<RegistryState>,
}

impl EquivalentResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resource` under its own group/resource identity.
    pub fn register_kind_for(
        &self,
        resource: GroupVersionResource,
        subresource: &str,
        kind: GroupVersionKind,
    ) {
        let gr = resource.group_resource();
        let identity = format!("{}.{}", gr.resource, gr.group);
        self.register(&identity, resource, subresource, kind);
    }

    pub fn register(
        &self,
        identity: &str,
        resource: GroupVersionResource,
        subresource: &str,
        kind: GroupVersionKind,
    ) {
        let mut state = self.state.write();
        state
            .kinds
            .insert((resource.clone(), subresource.to_string()), kind);
        state
            .identities
            .insert(resource.clone(), identity.to_string());
        state
            .members
            .entry(identity.to_string())
            .or_default()
            .entry(subresource.to_string())
            .or_default()
            .insert(resource);
    }
}

impl EquivalentResourceMapper for EquivalentResourceRegistry {
    fn equivalent_resources_for(
        &self,
        resource: &GroupVersionResource,
        subresource: &str,
    ) -> Vec<GroupVersionResource> {
        let state = self.state.read();
        state
            .identities
            .get(resource)
            .and_then(|identity| state.members.get(identity))
            .and_then(|by_subresource| by_subresource.get(subresource))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn kind_for(
        &self,
        resource: &GroupVersionResource,
        subresource: &str,
    ) -> Option<GroupVersionKind> {
        self.state
            .read()
            .kinds
            .get(&(resource.clone(), subresource.to_string()))
            .cloned()
    }
}

/// [`ObjectInterfaces`] for [`DynamicObject`]s.
pub struct DynamicObjects {
    convertor: Box<dyn ObjectConvertor>,
    defaulter: Box<dyn ObjectDefaulter>,
    mapper: Arc<EquivalentResourceRegistry>,
}

impl DynamicObjects {
    pub fn new(mapper: Arc<EquivalentResourceRegistry>) -> Self {
        Self {
            convertor: Box::new(TypeMetaConvertor),
            defaulter: Box::new(NoDefaults),
            mapper,
        }
    }

    pub fn with_convertor(mut self, convertor: impl ObjectConvertor + 'static) -> Self {
        self.convertor = Box::new(convertor);
        self
    }

    pub fn with_defaulter(mut self, defaulter: impl ObjectDefaulter + 'static) -> Self {
        self.defaulter = Box::new(defaulter);
        self
    }
}

impl ObjectInterfaces for DynamicObjects {
    fn convertor(&self) -> &dyn ObjectConvertor {
        self.convertor.as_ref()
    }

    fn defaulter(&self) -> &dyn ObjectDefaulter {
        self.defaulter.as_ref()
    }

    fn equivalent_resource_mapper(&self) -> &dyn EquivalentResourceMapper {
        self.mapper.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployments_registry() -> EquivalentResourceRegistry {
        let registry = EquivalentResourceRegistry::new();
        for (group, version) in [("apps", "v1"), ("apps", "v1beta1"), ("extensions", "v1beta1")] {
            registry.register(
                "deployments.apps",
                GroupVersionResource::new(group, version, "deployments"),
                "",
                GroupVersionKind::new(group, version, "Deployment"),
            );
        }
        registry
    }

    #[test]
    fn test_equivalent_resources_share_identity() {
        let registry = deployments_registry();
        let equivalents = registry
            .equivalent_resources_for(&GroupVersionResource::new("apps", "v1", "deployments"), "");
        assert_eq!(equivalents.len(), 3);
        assert!(equivalents.contains(&GroupVersionResource::new(
            "extensions",
            "v1beta1",
            "deployments"
        )));
    }

    #[test]
    fn test_equivalent_resources_unknown_resource_is_empty() {
        let registry = deployments_registry();
        assert!(registry
            .equivalent_resources_for(&GroupVersionResource::new("", "v1", "pods"), "")
            .is_empty());
        assert!(registry
            .equivalent_resources_for(
                &GroupVersionResource::new("apps", "v1", "deployments"),
                "scale"
            )
            .is_empty());
    }

    #[test]
    fn test_kind_for() {
        let registry = deployments_registry();
        assert_eq!(
            registry.kind_for(&GroupVersionResource::new("extensions", "v1beta1", "deployments"), ""),
            Some(GroupVersionKind::new("extensions", "v1beta1", "Deployment"))
        );
        assert_eq!(
            registry.kind_for(&GroupVersionResource::new("apps", "v1", "deployments"), "status"),
            None
        );
    }

    #[test]
    fn test_type_meta_convertor_rewrites_kind() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"replicas": 2}
        }))
        .unwrap();
        let out = TypeMetaConvertor
            .convert_to_kind(&object, &GroupVersionKind::new("extensions", "v1beta1", "Deployment"))
            .unwrap();
        let types = out.types.unwrap();
        assert_eq!(types.api_version, "extensions/v1beta1");
        assert_eq!(types.kind, "Deployment");
        assert_eq!(out.data["spec"]["replicas"], 2);
    }
}
