use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{GroupVersionKind, GroupVersionResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Connect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Some(Operation::Create),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            "CONNECT" => Some(Operation::Connect),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("annotation {key:?} is already set to {existing:?}, refusing to change it to {value:?}")]
pub struct AnnotationConflict {
    pub key: String,
    pub existing: String,
    pub value: String,
}

/// Everything admission knows about one API request.
///
/// Audit annotations and warnings sit behind shared locks: validating webhooks
/// report them concurrently, and clones write into the same collections.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub resource: GroupVersionResource,
    pub subresource: String,
    pub operation: Operation,
    pub kind: GroupVersionKind,
    pub dry_run: bool,
    pub object: Option<DynamicObject>,
    pub old_object: Option<DynamicObject>,
    pub options: Option<serde_json::Value>,
    pub user_info: UserInfo,
    annotations: Arc<Mutex<BTreeMap<String, String>>>,
    warnings: Arc<Mutex<Vec<String>>>,
}

impl Attributes {
    pub fn new(
        uid: impl Into<String>,
        kind: GroupVersionKind,
        resource: GroupVersionResource,
        operation: Operation,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: String::new(),
            namespace: String::new(),
            resource,
            subresource: String::new(),
            operation,
            kind,
            dry_run: false,
            object: None,
            old_object: None,
            options: None,
            user_info: UserInfo::default(),
            annotations: Arc::new(Mutex::new(BTreeMap::new())),
            warnings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_name(mut self, namespace: &str, name: &str) -> Self {
        self.namespace = namespace.to_string();
        self.name = name.to_string();
        self
    }

    pub fn with_subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.to_string();
        self
    }

    pub fn with_object(mut self, object: DynamicObject) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_old_object(mut self, old_object: DynamicObject) -> Self {
        self.old_object = Some(old_object);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Records an audit annotation. Setting a key again with the same value is
    /// a no-op; a different value is rejected and the first value is kept.
    pub fn add_annotation(&self, key: &str, value: &str) -> Result<(), AnnotationConflict> {
        let mut annotations = self.annotations.lock();
        match annotations.get(key) {
            Some(existing) if existing == value => Ok(()),
            Some(existing) => Err(AnnotationConflict {
                key: key.to_string(),
                existing: existing.clone(),
                value: value.to_string(),
            }),
            None => {
                annotations.insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.annotations.lock().clone()
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}
