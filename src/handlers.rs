use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use json_patch::Patch;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use tracing::{error, info, warn};

use webhook_admission::attributes::{Attributes, Operation};
use webhook_admission::errors::StatusError;
use webhook_admission::metrics::{AdmissionMetrics, RequestLabels, ResponseLabels};
use webhook_admission::object::DynamicObjects;
use webhook_admission::plugin::{MutatingWebhookPlugin, ValidatingWebhookPlugin};
use webhook_admission::schema::{GroupVersionKind, GroupVersionResource};

pub struct AppState {
    pub mutating: MutatingWebhookPlugin,
    pub validating: ValidatingWebhookPlugin,
    pub objects: DynamicObjects,
    pub metrics: Arc<AdmissionMetrics>,
}

pub type SharedState = Arc<AppState>;

#[derive(Clone, Copy)]
enum Step {
    Validate,
    Mutate,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Step::Validate => "validate",
            Step::Mutate => "mutate",
        }
    }
}

pub async fn handle_validate(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    handle_review(&state, body, Step::Validate).await
}

pub async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    handle_review(&state, body, Step::Mutate).await
}

async fn handle_review(state: &AppState, body: Value, step: Step) -> Json<Value> {
    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to deserialize AdmissionReview: {e}");
            let resp = AdmissionResponse::invalid(format!("failed to deserialize request: {e}"));
            return Json(review_to_value(resp.into_review()));
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            let resp = AdmissionResponse::invalid("missing request field in AdmissionReview");
            return Json(review_to_value(resp.into_review()));
        }
    };

    record_request_metrics(state, &req, step.as_str());

    let mut attrs = match attributes_from(&req) {
        Ok(attrs) => attrs,
        Err(e) => {
            warn!(uid = %req.uid, "rejecting malformed admission request: {e}");
            record_response_metrics(state, false, step.as_str());
            return Json(review_to_value(AdmissionResponse::from(&req).deny(e).into_review()));
        }
    };

    let result = match step {
        Step::Mutate => state.mutating.admit(&mut attrs, &state.objects).await,
        Step::Validate => state.validating.validate(&mut attrs, &state.objects).await,
    };
    if let Err(e) = &result {
        info!(uid = %req.uid, step = step.as_str(), code = e.code(), "admission denied: {e}");
    }

    let (allowed, value) = build_response(&req, &attrs, result);
    record_response_metrics(state, allowed, step.as_str());
    Json(value)
}

fn review_to_value(review: AdmissionReview<DynamicObject>) -> Value {
    serde_json::to_value(review).unwrap_or_else(|e| {
        error!("failed to serialize AdmissionReview: {e}");
        Value::Null
    })
}

/// Translates an inbound admission request into [`Attributes`].
fn attributes_from(req: &AdmissionRequest<DynamicObject>) -> Result<Attributes, String> {
    let operation = format!("{:?}", req.operation).to_uppercase();
    let operation = Operation::parse(&operation)
        .ok_or_else(|| format!("unsupported operation {operation}"))?;
    let options = req
        .options
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| format!("invalid options: {e}"))?;

    let mut attrs = Attributes::new(
        req.uid.clone(),
        GroupVersionKind::new(&req.kind.group, &req.kind.version, &req.kind.kind),
        GroupVersionResource::new(
            &req.resource.group,
            &req.resource.version,
            &req.resource.resource,
        ),
        operation,
    )
    .with_name(req.namespace.as_deref().unwrap_or_default(), &req.name)
    .with_subresource(req.sub_resource.as_deref().unwrap_or_default())
    .with_dry_run(req.dry_run);
    attrs.object = req.object.clone();
    attrs.old_object = req.old_object.clone();
    attrs.options = options;
    attrs.user_info = req.user_info.clone();
    Ok(attrs)
}

/// The JSON patch taking the submitted object to the admitted one.
fn mutation_patch(
    req: &AdmissionRequest<DynamicObject>,
    attrs: &Attributes,
) -> Result<Option<Patch>, serde_json::Error> {
    let (Some(before), Some(after)) = (&req.object, &attrs.object) else {
        return Ok(None);
    };
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    let patch = json_patch::diff(&before, &after);
    Ok((!patch.0.is_empty()).then_some(patch))
}

fn build_response(
    req: &AdmissionRequest<DynamicObject>,
    attrs: &Attributes,
    result: Result<(), StatusError>,
) -> (bool, Value) {
    let mut resp = AdmissionResponse::from(req);
    let mut status = None;

    match result {
        Ok(()) => match mutation_patch(req, attrs) {
            Ok(None) => {}
            Ok(Some(patch)) => {
                resp = match resp.with_patch(patch) {
                    Ok(patched) => patched,
                    Err(e) => {
                        error!(uid = %req.uid, "failed to serialize patch: {e}");
                        AdmissionResponse::from(req).deny("failed to serialize mutation patch")
                    }
                };
            }
            Err(e) => {
                error!(uid = %req.uid, "failed to compute patch: {e}");
                resp = resp.deny("failed to compute mutation patch");
            }
        },
        Err(err) => {
            resp = resp.deny(&err.status.message);
            status = Some(err.status);
        }
    }

    let warnings = attrs.warnings();
    if !warnings.is_empty() {
        resp.warnings.get_or_insert_with(Vec::new).extend(warnings);
    }

    let allowed = resp.allowed;
    let mut value = review_to_value(resp.into_review());
    if let Some(status) = status {
        match serde_json::to_value(&status) {
            Ok(status) => value["response"]["status"] = status,
            Err(e) => error!(uid = %req.uid, "failed to serialize status: {e}"),
        }
    }
    let annotations = attrs.annotations();
    if !annotations.is_empty() {
        value["response"]["auditAnnotations"] = serde_json::json!(annotations);
    }
    (allowed, value)
}

fn record_request_metrics(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    webhook: &'static str,
) {
    let operation = format!("{:?}", req.operation).to_uppercase();
    let resource = req.resource.resource.clone();

    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation,
            resource,
            webhook,
        })
        .inc();
}

fn record_response_metrics(state: &AppState, allowed: bool, webhook: &'static str) {
    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels {
            allowed: if allowed { "true" } else { "false" },
            webhook,
        })
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::admissionregistration::v1::{
        MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
    };
    use prometheus_client::registry::Registry;
    use serde_json::json;
    use webhook_admission::client::{ClientManager, DnsServiceResolver, StaticAuthenticationInfoResolver};
    use webhook_admission::dispatcher::WebhookCaller;
    use webhook_admission::object::EquivalentResourceRegistry;
    use webhook_admission::webhook::selector::StaticNamespaceLister;
    use webhook_admission::webhook::source::ConfigurationManager;

    fn state_with(
        mutating: Vec<MutatingWebhookConfiguration>,
        validating: Vec<ValidatingWebhookConfiguration>,
    ) -> AppState {
        let metrics = Arc::new(AdmissionMetrics::new(&mut Registry::default()));
        let clients = Arc::new(
            ClientManager::default()
                .with_authentication_info_resolver(Arc::new(StaticAuthenticationInfoResolver::default()))
                .with_service_resolver(Arc::new(DnsServiceResolver)),
        );
        let namespaces = Arc::new(StaticNamespaceLister::new());

        let mutating_source = Arc::new(ConfigurationManager::new());
        mutating_source.rebuild(mutating);
        mutating_source.mark_synced();
        let validating_source = Arc::new(ConfigurationManager::new());
        validating_source.rebuild(validating);
        validating_source.mark_synced();

        AppState {
            mutating: MutatingWebhookPlugin::new(
                mutating_source,
                namespaces.clone(),
                WebhookCaller::new(clients.clone(), metrics.clone()),
            ),
            validating: ValidatingWebhookPlugin::new(
                validating_source,
                namespaces,
                WebhookCaller::new(clients, metrics.clone()),
            ),
            objects: DynamicObjects::new(Arc::new(EquivalentResourceRegistry::new())),
            metrics,
        }
    }

    fn pod_review(operation: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "requestKind": {"group": "", "version": "v1", "kind": "Pod"},
                "requestResource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "web",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default", "labels": {}},
                    "spec": {"containers": [{"name": "app", "image": "nginx"}]}
                },
                "dryRun": false
            }
        })
    }

    #[tokio::test]
    async fn test_no_webhooks_admits() {
        let state = state_with(Vec::new(), Vec::new());
        let Json(out) = handle_review(&state, pod_review("CREATE"), Step::Validate).await;
        assert_eq!(out["response"]["allowed"], json!(true));
        assert_eq!(out["response"]["uid"], json!("705ab4f5-6393-11e8-b7cc-42010a800002"));
        assert!(out["response"].get("patch").is_none());
    }

    #[tokio::test]
    async fn test_malformed_review_is_rejected() {
        let state = state_with(Vec::new(), Vec::new());
        let Json(out) = handle_review(&state, json!({"kind": 7}), Step::Mutate).await;
        assert_eq!(out["response"]["allowed"], json!(false));
    }

    #[tokio::test]
    async fn test_attributes_from_request() {
        let review: AdmissionReview<DynamicObject> =
            serde_json::from_value(pod_review("UPDATE")).unwrap();
        let req: AdmissionRequest<DynamicObject> = review.try_into().unwrap();
        let attrs = attributes_from(&req).unwrap();
        assert_eq!(attrs.operation, Operation::Update);
        assert_eq!(attrs.namespace, "default");
        assert_eq!(attrs.name, "web");
        assert_eq!(attrs.resource, GroupVersionResource::new("", "v1", "pods"));
        assert_eq!(attrs.user_info.username.as_deref(), Some("admin"));
        assert!(attrs.object.is_some());
    }

    #[tokio::test]
    async fn test_denial_carries_status_and_annotations() {
        let req: AdmissionRequest<DynamicObject> =
            serde_json::from_value::<AdmissionReview<DynamicObject>>(pod_review("CREATE"))
                .unwrap()
                .try_into()
                .unwrap();
        let attrs = attributes_from(&req).unwrap();
        attrs.add_annotation("policy.example.com/checked", "yes").unwrap();
        attrs.add_warning("image tag is mutable");

        let denied = StatusError::webhook_denied("policy.example.com", None);
        let (allowed, out) = build_response(&req, &attrs, Err(denied));
        assert!(!allowed);
        assert_eq!(out["response"]["status"]["code"], json!(400));
        assert_eq!(
            out["response"]["status"]["message"],
            json!("admission webhook \"policy.example.com\" denied the request without explanation")
        );
        assert_eq!(
            out["response"]["auditAnnotations"]["policy.example.com/checked"],
            json!("yes")
        );
        assert_eq!(out["response"]["warnings"], json!(["image tag is mutable"]));
    }

    #[tokio::test]
    async fn test_mutation_is_returned_as_patch() {
        let req: AdmissionRequest<DynamicObject> =
            serde_json::from_value::<AdmissionReview<DynamicObject>>(pod_review("CREATE"))
                .unwrap()
                .try_into()
                .unwrap();
        let mut attrs = attributes_from(&req).unwrap();
        if let Some(object) = attrs.object.as_mut() {
            object
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert("injected".to_string(), "true".to_string());
        }

        let patch = mutation_patch(&req, &attrs).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "add", "path": "/metadata/labels/injected", "value": "true"}])
        );

        let (allowed, out) = build_response(&req, &attrs, Ok(()));
        assert!(allowed);
        assert_eq!(out["response"]["patchType"], json!("JSONPatch"));
    }
}
