//! Dispatches Kubernetes admission requests to mutating and validating
//! webhooks declared by webhook configuration objects.

pub mod attributes;
pub mod client;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod object;
pub mod plugin;
pub mod review;
pub mod schema;
pub mod tls;
pub mod webhook;
