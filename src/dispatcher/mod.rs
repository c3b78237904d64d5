pub mod mutating;
pub mod policy;
pub mod validating;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::core::DynamicObject;
use tracing::warn;

use crate::attributes::Attributes;
use crate::client::{ClientManager, DEFAULT_TIMEOUT};
use crate::errors::{CallingWebhookError, HookError, StatusError};
use crate::metrics::AdmissionMetrics;
use crate::object::{ObjectConvertor, ObjectInterfaces};
use crate::review::{AdmissionResponse, AdmissionReview, create_admission_review, verify_response};
use crate::schema::GroupVersionKind;
use crate::webhook::{ADMISSION_REVIEW_VERSION, WebhookInvocation};

pub use mutating::MutatingDispatcher;
pub use validating::ValidatingDispatcher;

/// Runs the webhooks selected for one request.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
        invocations: Vec<WebhookInvocation>,
    ) -> Result<(), StatusError>;
}

/// The request's objects expressed in the kind a webhook expects.
#[derive(Debug, Clone)]
pub struct VersionedAttributes {
    pub kind: GroupVersionKind,
    pub object: Option<DynamicObject>,
    pub old_object: Option<DynamicObject>,
    /// Set once a webhook has patched `object`.
    pub dirty: bool,
}

impl VersionedAttributes {
    pub fn new(
        attrs: &Attributes,
        kind: &GroupVersionKind,
        convertor: &dyn ObjectConvertor,
    ) -> Result<Self, StatusError> {
        let convert = |object: Option<&DynamicObject>| -> Result<Option<DynamicObject>, StatusError> {
            match object {
                Some(object) if attrs.kind != *kind => convertor
                    .convert_to_kind(object, kind)
                    .map(Some)
                    .map_err(StatusError::internal),
                other => Ok(other.cloned()),
            }
        };
        Ok(Self {
            kind: kind.clone(),
            object: convert(attrs.object.as_ref())?,
            old_object: convert(attrs.old_object.as_ref())?,
            dirty: false,
        })
    }

    /// Re-expresses both objects in `kind`. Patches applied so far are kept.
    pub fn convert_to(
        &mut self,
        kind: &GroupVersionKind,
        convertor: &dyn ObjectConvertor,
    ) -> Result<(), StatusError> {
        if self.kind == *kind {
            return Ok(());
        }
        for slot in [&mut self.object, &mut self.old_object] {
            if let Some(object) = slot.as_ref() {
                *slot = Some(
                    convertor
                        .convert_to_kind(object, kind)
                        .map_err(StatusError::internal)?,
                );
            }
        }
        self.kind = kind.clone();
        Ok(())
    }
}

/// The part of a webhook call both dispatchers share: admission gates, the
/// HTTP exchange, response verification, annotations and warnings.
pub struct WebhookCaller {
    clients: Arc<ClientManager>,
    metrics: Arc<AdmissionMetrics>,
    default_timeout: Duration,
}

impl WebhookCaller {
    pub fn new(clients: Arc<ClientManager>, metrics: Arc<AdmissionMetrics>) -> Self {
        Self {
            clients,
            metrics,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Timeout for webhooks that do not declare one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    pub async fn call(
        &self,
        invocation: &WebhookInvocation,
        attrs: &Attributes,
        versioned: &VersionedAttributes,
    ) -> Result<AdmissionResponse, HookError> {
        let hook = &invocation.webhook;
        let calling = |reason: String| HookError::from(CallingWebhookError::new(&hook.name, reason));

        if attrs.dry_run {
            match hook.side_effects {
                None => return Err(calling("Webhook SideEffects is nil".to_string())),
                Some(class) if !class.supports_dry_run() => {
                    return Err(StatusError::dry_run_unsupported(&hook.name).into());
                }
                Some(_) => {}
            }
        }

        if !hook.accepts_admission_review_version() {
            return Err(calling(format!(
                "webhook does not accept {ADMISSION_REVIEW_VERSION} AdmissionReview, accepted versions: {:?}",
                hook.admission_review_versions
            )));
        }

        let client = hook
            .rest_client(&self.clients)
            .map_err(|e| calling(format!("could not get REST client: {e}")))?;
        let review = create_admission_review(
            attrs,
            invocation,
            versioned.object.as_ref(),
            versioned.old_object.as_ref(),
        )
        .map_err(|e| calling(format!("could not create admission objects: {e}")))?;

        let timeout = hook.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let reply: AdmissionReview = match client.post(&review, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.metrics.observe_webhook(
                    &hook.name,
                    hook.kind,
                    attrs.operation,
                    true,
                    started.elapsed(),
                );
                return Err(calling(format!("failed to call webhook: {e}")));
            }
        };
        let response = verify_response(&attrs.uid, hook.kind, reply)
            .map_err(|e| calling(format!("received invalid webhook response: {e}")))?;
        self.metrics.observe_webhook(
            &hook.name,
            hook.kind,
            attrs.operation,
            !response.allowed,
            started.elapsed(),
        );

        for (key, value) in response.audit_annotations.iter().flatten() {
            let key = format!("{}/{key}", hook.name);
            if let Err(e) = attrs.add_annotation(&key, value) {
                warn!(webhook = %hook.name, "dropping audit annotation from webhook: {e}");
            }
        }
        for warning in response.warnings.iter().flatten() {
            attrs.add_warning(warning.clone());
        }

        Ok(response)
    }
}

/// Audit annotation key recorded for a webhook invocation at `index`.
pub(crate) fn invocation_annotation_key(prefix: &str, index: usize) -> String {
    format!("{prefix}/round_0_index_{index}")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::Router;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::service::TowerToHyperService;
    use prometheus_client::registry::Registry;
    use rustls::ServerConfig;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use super::WebhookCaller;
    use crate::client::{
        ClientManager, DnsServiceResolver, ServiceResolver, StaticAuthenticationInfoResolver,
    };
    use crate::metrics::AdmissionMetrics;
    use crate::webhook::{FailurePolicy, Rule, Webhook, WebhookKind};

    /// Serves `router` over plain HTTP on an ephemeral local port.
    pub async fn serve(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Serves `router` over TLS with a fresh self-signed certificate for
    /// `dns_name`. Returns the address and the certificate as PEM.
    pub async fn serve_tls(router: Router, dns_name: &str) -> (SocketAddr, String) {
        let cert = rcgen::generate_simple_self_signed(vec![dns_name.to_string()]).unwrap();
        let pem = cert.serialize_pem().unwrap();
        let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(router.clone().into_service());
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, pem)
    }

    pub fn caller() -> WebhookCaller {
        caller_with_services(Arc::new(DnsServiceResolver))
    }

    pub fn caller_with_services(services: Arc<dyn ServiceResolver>) -> WebhookCaller {
        let clients = ClientManager::default()
            .with_authentication_info_resolver(Arc::new(StaticAuthenticationInfoResolver::default()))
            .with_service_resolver(services);
        let mut registry = Registry::default();
        WebhookCaller::new(Arc::new(clients), Arc::new(AdmissionMetrics::new(&mut registry)))
    }

    pub fn hook(name: &str, kind: WebhookKind, url: String, policy: FailurePolicy) -> Webhook {
        let mut hook = Webhook::new(name, kind);
        hook.rules = vec![Rule::new(&["*"], &["*"], &["*"], &["*"])];
        hook.failure_policy = policy;
        hook.client_config.url = Some(url);
        hook
    }

    /// The `response` part of a reply to `review`, with the matching UID.
    pub fn reply(review: &Value, response: Value) -> Value {
        let mut response = response;
        response["uid"] = review["request"]["uid"].clone();
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "response": response,
        })
    }
}
