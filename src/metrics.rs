use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::attributes::Operation;
use crate::webhook::WebhookKind;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub name: String,
    pub r#type: &'static str,
    pub operation: &'static str,
    pub rejected: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    pub name: String,
    pub r#type: &'static str,
    pub operation: &'static str,
    pub error_type: &'static str,
    pub rejection_code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailOpenLabels {
    pub name: String,
    pub r#type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub resource: String,
    pub webhook: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub allowed: &'static str,
    pub webhook: &'static str,
}

/// Why a webhook invocation ended the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionType {
    CallingWebhookError,
    InternalError,
    NoError,
}

impl RejectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionType::CallingWebhookError => "calling_webhook_error",
            RejectionType::InternalError => "apiserver_internal_error",
            RejectionType::NoError => "no_error",
        }
    }
}

/// Webhook call and gateway metrics, registered once and handed to the
/// dispatchers and handlers that record into them.
pub struct AdmissionMetrics {
    pub webhook_admission_duration_seconds: Family<WebhookLabels, Histogram>,
    pub webhook_rejection_count: Family<RejectionLabels, Counter>,
    pub webhook_fail_open_count: Family<FailOpenLabels, Counter>,
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
}

const DURATION_BUCKETS: [f64; 11] = [0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl AdmissionMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let webhook_admission_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "webhook_admission_duration_seconds",
            "Admission webhook latency in seconds, by webhook name, step type and operation",
            webhook_admission_duration_seconds.clone(),
        );

        let webhook_rejection_count = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "webhook_rejection_count",
            "Admission webhook rejections, by error type and rejection code",
            webhook_rejection_count.clone(),
        );

        let webhook_fail_open_count = Family::<FailOpenLabels, Counter>::default();
        registry.register(
            "webhook_fail_open_count",
            "Admission webhook calls that failed and were ignored",
            webhook_fail_open_count.clone(),
        );

        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "admission_gateway_requests",
            "Total number of admission reviews received by the gateway",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "admission_gateway_responses",
            "Total number of admission reviews answered by the gateway",
            admission_responses_total.clone(),
        );

        Self {
            webhook_admission_duration_seconds,
            webhook_rejection_count,
            webhook_fail_open_count,
            admission_requests_total,
            admission_responses_total,
        }
    }

    pub fn observe_webhook(
        &self,
        name: &str,
        kind: WebhookKind,
        operation: Operation,
        rejected: bool,
        elapsed: Duration,
    ) {
        self.webhook_admission_duration_seconds
            .get_or_create(&WebhookLabels {
                name: name.to_string(),
                r#type: kind.as_str(),
                operation: operation.as_str(),
                rejected: if rejected { "true" } else { "false" },
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_rejection(
        &self,
        name: &str,
        kind: WebhookKind,
        operation: Operation,
        rejection: RejectionType,
        code: i32,
    ) {
        self.webhook_rejection_count
            .get_or_create(&RejectionLabels {
                name: name.to_string(),
                r#type: kind.as_str(),
                operation: operation.as_str(),
                error_type: rejection.as_str(),
                rejection_code: code.to_string(),
            })
            .inc();
    }

    pub fn observe_fail_open(&self, name: &str, kind: WebhookKind) {
        self.webhook_fail_open_count
            .get_or_create(&FailOpenLabels {
                name: name.to_string(),
                r#type: kind.as_str(),
            })
            .inc();
    }
}
