use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attributes::{Attributes, Operation};
use crate::errors::Status;
use crate::schema::{GroupVersionKind, GroupVersionResource};
use crate::webhook::{WebhookInvocation, WebhookKind};

pub const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";
pub const PATCH_TYPE_JSON_PATCH: &str = "JSONPatch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_sub_resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl AdmissionResponse {
    pub fn patch_bytes(&self) -> &[u8] {
        self.patch.as_ref().map(|p| p.0.as_slice()).unwrap_or_default()
    }
}

/// Builds the review sent to one webhook. The webhook sees the invocation's
/// resource and kind; the request's own coordinates go in the `request*`
/// fields.
pub fn create_admission_review(
    attrs: &Attributes,
    invocation: &WebhookInvocation,
    object: Option<&DynamicObject>,
    old_object: Option<&DynamicObject>,
) -> Result<AdmissionReview, serde_json::Error> {
    let request = AdmissionRequest {
        uid: attrs.uid.clone(),
        kind: invocation.kind.clone(),
        resource: invocation.resource.clone(),
        sub_resource: invocation.subresource.clone(),
        request_kind: Some(attrs.kind.clone()),
        request_resource: Some(attrs.resource.clone()),
        request_sub_resource: attrs.subresource.clone(),
        name: attrs.name.clone(),
        namespace: attrs.namespace.clone(),
        operation: attrs.operation,
        user_info: attrs.user_info.clone(),
        object: object.map(serde_json::to_value).transpose()?,
        old_object: old_object.map(serde_json::to_value).transpose()?,
        dry_run: Some(attrs.dry_run),
        options: attrs.options.clone(),
    };

    Ok(AdmissionReview {
        api_version: ADMISSION_API_VERSION.to_string(),
        kind: ADMISSION_REVIEW_KIND.to_string(),
        request: Some(request),
        response: None,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("webhook response was absent")]
    Absent,
    #[error("expected response.uid={expected:?}, got {got:?}")]
    UidMismatch { expected: String, got: String },
    #[error("expected webhook response of admission.k8s.io/v1, Kind=AdmissionReview, got {api_version}, Kind={kind}")]
    UnexpectedKind { api_version: String, kind: String },
    #[error("expected patchType=\"JSONPatch\" if patch is set, got {0:?}")]
    PatchType(String),
    #[error("validating webhook may not return a patch or patchType")]
    ValidatingPatch,
}

/// Checks a webhook's reply against the request that produced it.
pub fn verify_response(
    uid: &str,
    kind: WebhookKind,
    review: AdmissionReview,
) -> Result<AdmissionResponse, ResponseError> {
    let response = review.response.ok_or(ResponseError::Absent)?;
    if response.uid != uid {
        return Err(ResponseError::UidMismatch {
            expected: uid.to_string(),
            got: response.uid,
        });
    }
    if review.api_version != ADMISSION_API_VERSION || review.kind != ADMISSION_REVIEW_KIND {
        return Err(ResponseError::UnexpectedKind {
            api_version: review.api_version,
            kind: review.kind,
        });
    }

    let patch_type = response.patch_type.as_deref().unwrap_or_default();
    let has_patch = !response.patch_bytes().is_empty();
    if has_patch && patch_type != PATCH_TYPE_JSON_PATCH {
        return Err(ResponseError::PatchType(patch_type.to_string()));
    }
    if kind == WebhookKind::Validating && (has_patch || !patch_type.is_empty()) {
        return Err(ResponseError::ValidatingPatch);
    }
    Ok(response)
}
