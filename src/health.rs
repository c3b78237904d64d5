use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use webhook_admission::webhook::source::WebhookSource;

pub struct HealthState {
    pub registry: Arc<Registry>,
    /// Set once the webhook listener is bound.
    pub serving: Arc<AtomicBool>,
    pub sources: Vec<Arc<dyn WebhookSource>>,
}

impl HealthState {
    fn is_ready(&self) -> bool {
        self.serving.load(Ordering::Relaxed) && self.sources.iter().all(|s| s.has_synced())
    }
}

pub type SharedHealthState = Arc<HealthState>;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<SharedHealthState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub async fn metrics_handler(State(state): State<SharedHealthState>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
