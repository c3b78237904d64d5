use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::attributes::{Attributes, Operation};
use crate::dispatcher::{Dispatcher, MutatingDispatcher, ValidatingDispatcher, WebhookCaller};
use crate::errors::StatusError;
use crate::object::ObjectInterfaces;
use crate::webhook::selector::NamespaceLister;
use crate::webhook::source::WebhookSource;
use crate::webhook::{WebhookInvocation, should_call_hook};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

const ADMISSION_REGISTRATION_GROUP: &str = "admissionregistration.k8s.io";

/// Requests touching webhook configurations never go to webhooks.
fn is_exempt(attrs: &Attributes) -> bool {
    attrs.resource.group == ADMISSION_REGISTRATION_GROUP
        && matches!(
            attrs.resource.resource.as_str(),
            "mutatingwebhookconfigurations" | "validatingwebhookconfigurations"
        )
}

/// Selects the webhooks of one source that apply to a request and hands them
/// to a dispatcher.
pub struct WebhookPlugin {
    source: Arc<dyn WebhookSource>,
    namespaces: Arc<dyn NamespaceLister>,
    dispatcher: Box<dyn Dispatcher>,
    ready_timeout: Duration,
}

impl WebhookPlugin {
    pub fn new(
        source: Arc<dyn WebhookSource>,
        namespaces: Arc<dyn NamespaceLister>,
        dispatcher: impl Dispatcher + 'static,
    ) -> Self {
        Self {
            source,
            namespaces,
            dispatcher: Box::new(dispatcher),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn handles(&self, operation: Operation) -> bool {
        Operation::ALL.contains(&operation)
    }

    pub fn is_ready(&self) -> bool {
        self.source.has_synced()
    }

    async fn wait_for_ready(&self) -> bool {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if self.source.has_synced() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn dispatch(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
    ) -> Result<(), StatusError> {
        if !self.handles(attrs.operation) || is_exempt(attrs) {
            return Ok(());
        }
        if !self.wait_for_ready().await {
            return Err(StatusError::forbidden(
                &attrs.resource.group_resource().to_string(),
                &attrs.name,
                "not yet ready to handle request",
            ));
        }

        let webhooks = self.source.webhooks();
        let mut invocations: Vec<WebhookInvocation> = Vec::new();
        for hook in webhooks.iter() {
            if let Some(invocation) =
                should_call_hook(hook, attrs, objects, self.namespaces.as_ref())?
            {
                invocations.push(invocation);
            }
        }
        if invocations.is_empty() {
            return Ok(());
        }

        debug!(
            uid = %attrs.uid,
            resource = %attrs.resource,
            operation = attrs.operation.as_str(),
            webhooks = invocations.len(),
            "dispatching admission webhooks"
        );
        self.dispatcher.dispatch(attrs, objects, invocations).await
    }
}

/// The mutating admission step. May change `attrs.object`.
pub struct MutatingWebhookPlugin {
    inner: WebhookPlugin,
}

impl MutatingWebhookPlugin {
    pub fn new(
        source: Arc<dyn WebhookSource>,
        namespaces: Arc<dyn NamespaceLister>,
        caller: WebhookCaller,
    ) -> Self {
        Self {
            inner: WebhookPlugin::new(source, namespaces, MutatingDispatcher::new(caller)),
        }
    }

    pub fn with_ready_timeout(self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.with_ready_timeout(timeout),
        }
    }

    pub fn handles(&self, operation: Operation) -> bool {
        self.inner.handles(operation)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn admit(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
    ) -> Result<(), StatusError> {
        self.inner.dispatch(attrs, objects).await
    }
}

/// The validating admission step. Never changes the request.
pub struct ValidatingWebhookPlugin {
    inner: WebhookPlugin,
}

impl ValidatingWebhookPlugin {
    pub fn new(
        source: Arc<dyn WebhookSource>,
        namespaces: Arc<dyn NamespaceLister>,
        caller: WebhookCaller,
    ) -> Self {
        Self {
            inner: WebhookPlugin::new(source, namespaces, ValidatingDispatcher::new(caller)),
        }
    }

    pub fn with_ready_timeout(self, timeout: Duration) -> Self {
        Self {
            inner: self.inner.with_ready_timeout(timeout),
        }
    }

    pub fn handles(&self, operation: Operation) -> bool {
        self.inner.handles(operation)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn validate(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
    ) -> Result<(), StatusError> {
        self.inner.dispatch(attrs, objects).await
    }
}
