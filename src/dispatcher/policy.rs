use tracing::{error, warn};

use crate::attributes::Attributes;
use crate::errors::{HookError, StatusError};
use crate::metrics::{AdmissionMetrics, RejectionType};
use crate::webhook::{FailurePolicy, Webhook, WebhookKind};

/// What a dispatcher does with a failed webhook invocation.
#[derive(Debug)]
pub enum Decision {
    /// Carry on as if the webhook had allowed the request.
    Ignore,
    Abort(StatusError),
}

/// Applies the webhook's failure policy to `err`. Only failures to reach or
/// understand the webhook are subject to the policy; denials, dry-run
/// violations and internal errors always end the request.
pub fn evaluate(
    hook: &Webhook,
    index: usize,
    attrs: &Attributes,
    err: HookError,
    metrics: &AdmissionMetrics,
) -> Decision {
    match err {
        HookError::Calling(e) if hook.failure_policy == FailurePolicy::Ignore => {
            warn!(webhook = %hook.name, uid = %attrs.uid, "failed calling webhook, failing open: {e}");
            metrics.observe_fail_open(&hook.name, hook.kind);
            let key = super::invocation_annotation_key(failed_open_prefix(hook.kind), index);
            if let Err(e) = attrs.add_annotation(&key, &hook.name) {
                warn!(webhook = %hook.name, "failed to record fail-open annotation: {e}");
            }
            Decision::Ignore
        }
        HookError::Calling(e) => {
            error!(webhook = %hook.name, uid = %attrs.uid, "failed calling webhook, failing closed: {e}");
            metrics.observe_rejection(
                &hook.name,
                hook.kind,
                attrs.operation,
                RejectionType::CallingWebhookError,
                0,
            );
            Decision::Abort(StatusError::internal(format!(
                "failed calling webhook \"{}\"",
                hook.name
            )))
        }
        HookError::Rejected(status) => {
            metrics.observe_rejection(
                &hook.name,
                hook.kind,
                attrs.operation,
                RejectionType::NoError,
                status.code(),
            );
            Decision::Abort(status)
        }
        HookError::Status(status) => {
            metrics.observe_rejection(
                &hook.name,
                hook.kind,
                attrs.operation,
                RejectionType::InternalError,
                status.code(),
            );
            Decision::Abort(status)
        }
    }
}

fn failed_open_prefix(kind: WebhookKind) -> &'static str {
    match kind {
        WebhookKind::Mutating => "failed-open.mutation.webhook.admission.k8s.io",
        WebhookKind::Validating => "failed-open.validating.webhook.admission.k8s.io",
    }
}
