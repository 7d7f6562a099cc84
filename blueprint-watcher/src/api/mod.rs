//! Apstra API clients: blueprint discovery and revision polling.
//!
//! Both clients share one [`ApiSession`] so a single login serves every
//! request. The orchestrator talks to them through the [`Discovery`] and
//! [`RevisionSource`] traits.

pub mod discovery;
pub mod revision;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use discovery::DiscoveryClient;
pub use revision::RevisionPoller;
pub use session::ApiSession;

use crate::inventory::Resource;
use crate::utils::errors::ApiError;
use std::future::Future;

/// Read-only enumeration of the blueprints that currently exist.
pub trait Discovery: Send + Sync + 'static {
    fn discover(&self) -> impl Future<Output = Result<Vec<Resource>, ApiError>> + Send;
}

/// Current revision token of one blueprint.
pub trait RevisionSource: Send + Sync + 'static {
    fn poll(&self, resource: &Resource) -> impl Future<Output = Result<String, ApiError>> + Send;
}
