use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STATUS_FAILURE: &str = "Failure";
pub const STATUS_SUCCESS: &str = "Success";

/// The `metav1.Status` subset webhooks send back on rejection and admission
/// returns to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .status.message)]
pub struct StatusError {
    pub status: Status,
}

impl StatusError {
    fn new(code: i32, reason: &str, message: String) -> Self {
        Self {
            status: Status {
                status: STATUS_FAILURE.to_string(),
                message,
                reason: reason.to_string(),
                code,
            },
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(
            500,
            "InternalError",
            format!("Internal error occurred: {err}"),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "BadRequest", message.into())
    }

    pub fn forbidden(resource: &str, name: &str, err: impl std::fmt::Display) -> Self {
        let message = if name.is_empty() {
            format!("{resource} is forbidden: {err}")
        } else {
            format!("{resource} \"{name}\" is forbidden: {err}")
        };
        Self::new(403, "Forbidden", message)
    }

    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::new(404, "NotFound", format!("{resource} \"{name}\" not found"))
    }

    pub fn dry_run_unsupported(webhook_name: &str) -> Self {
        Self::bad_request(format!(
            "admission webhook \"{webhook_name}\" does not support dry run"
        ))
    }

    /// Turns the result of a rejecting webhook into the error callers see.
    /// The code is raised to at least 400 and the status forced to Failure so
    /// a rejection can never read as a success.
    pub fn webhook_denied(webhook_name: &str, result: Option<Status>) -> Self {
        let denied_by = format!("admission webhook \"{webhook_name}\" denied the request");
        let mut status = result.unwrap_or_default();
        if status.code < 400 {
            status.code = 400;
        }
        if status.status.is_empty() || status.status == STATUS_SUCCESS {
            status.status = STATUS_FAILURE.to_string();
        }
        status.message = if !status.message.is_empty() {
            format!("{denied_by}: {}", status.message)
        } else if !status.reason.is_empty() {
            format!("{denied_by}: {}", status.reason)
        } else {
            format!("{denied_by} without explanation")
        };
        Self { status }
    }

    pub fn code(&self) -> i32 {
        self.status.code
    }
}

/// The webhook could not be consulted: network failure, timeout, bad or
/// absent response, unusable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed calling webhook \"{webhook_name}\": {reason}")]
pub struct CallingWebhookError {
    pub webhook_name: String,
    pub reason: String,
}

impl CallingWebhookError {
    pub fn new(webhook_name: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            webhook_name: webhook_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one failed webhook invocation, before failure policy applies.
#[derive(Debug, Clone, Error)]
pub enum HookError {
    #[error(transparent)]
    Calling(#[from] CallingWebhookError),
    #[error("{0}")]
    Rejected(StatusError),
    #[error(transparent)]
    Status(#[from] StatusError),
}
