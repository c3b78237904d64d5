use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::attributes::Attributes;
use crate::dispatcher::policy::{self, Decision};
use crate::dispatcher::{Dispatcher, VersionedAttributes, WebhookCaller};
use crate::errors::{HookError, StatusError};
use crate::object::ObjectInterfaces;
use crate::schema::GroupVersionKind;
use crate::webhook::WebhookInvocation;

/// Calls validating webhooks concurrently, one task each. All of them see the
/// same objects and the first error to arrive decides the request.
pub struct ValidatingDispatcher {
    caller: Arc<WebhookCaller>,
}

impl ValidatingDispatcher {
    pub fn new(caller: WebhookCaller) -> Self {
        Self {
            caller: Arc::new(caller),
        }
    }
}

async fn validate_one(
    caller: Arc<WebhookCaller>,
    index: usize,
    invocation: WebhookInvocation,
    attrs: Arc<Attributes>,
    versioned: Arc<VersionedAttributes>,
    errors: mpsc::Sender<StatusError>,
) {
    let hook = &invocation.webhook;
    let outcome = match caller.call(&invocation, &attrs, &versioned).await {
        Ok(response) if response.allowed => return,
        Ok(response) => HookError::Rejected(StatusError::webhook_denied(
            &hook.name,
            response.result,
        )),
        Err(err) => err,
    };

    if let Decision::Abort(status) = policy::evaluate(hook, index, &attrs, outcome, caller.metrics())
    {
        // capacity covers one error per webhook, so this never waits
        if errors.send(status).await.is_err() {
            debug!(webhook = %hook.name, "validation result discarded");
        }
    }
}

#[async_trait]
impl Dispatcher for ValidatingDispatcher {
    async fn dispatch(
        &self,
        attrs: &mut Attributes,
        objects: &dyn ObjectInterfaces,
        invocations: Vec<WebhookInvocation>,
    ) -> Result<(), StatusError> {
        if invocations.is_empty() {
            return Ok(());
        }
        // clones write annotations and warnings back into `attrs`
        let shared = Arc::new(attrs.clone());

        let mut by_kind: HashMap<GroupVersionKind, Arc<VersionedAttributes>> = HashMap::new();
        let mut prepared = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let versioned = match by_kind.get(&invocation.kind) {
                Some(versioned) => versioned.clone(),
                None => {
                    let versioned = Arc::new(VersionedAttributes::new(
                        &shared,
                        &invocation.kind,
                        objects.convertor(),
                    )?);
                    by_kind.insert(invocation.kind.clone(), versioned.clone());
                    versioned
                }
            };
            prepared.push((invocation, versioned));
        }

        let (tx, mut rx) = mpsc::channel(prepared.len());
        let tasks: Vec<_> = prepared
            .into_iter()
            .enumerate()
            .map(|(index, (invocation, versioned))| {
                tokio::spawn(validate_one(
                    self.caller.clone(),
                    index,
                    invocation,
                    shared.clone(),
                    versioned,
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let mut crashed = false;
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(uid = %attrs.uid, "validating webhook task failed: {e}");
                crashed = true;
            }
        }

        let first = rx.recv().await;
        while let Some(extra) = rx.recv().await {
            warn!(uid = %attrs.uid, "additional validating webhook error not returned: {extra}");
        }
        match first {
            Some(status) => Err(status),
            None if crashed => Err(StatusError::internal("validating webhook task failed")),
            None => Ok(()),
        }
    }
}
