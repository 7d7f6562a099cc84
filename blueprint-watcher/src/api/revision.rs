//! Per-blueprint revision polling.
//!
//! The revisions endpoint returns every revision of a blueprint. The token
//! handed back is the id of the latest one; callers only ever compare tokens
//! for equality.

use super::{ApiSession, RevisionSource};
use crate::inventory::Resource;
use crate::utils::errors::ApiError;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
struct RevisionList {
    #[serde(default)]
    items: Vec<Value>,
}

pub struct RevisionPoller {
    session: Arc<ApiSession>,
}

impl RevisionPoller {
    pub fn new(session: Arc<ApiSession>) -> Self {
        Self { session }
    }
}

impl RevisionSource for RevisionPoller {
    async fn poll(&self, resource: &Resource) -> Result<String, ApiError> {
        let list: RevisionList = self.session.get_json(&resource.endpoint).await?;
        let latest = latest_revision(&list.items)
            .ok_or_else(|| ApiError::NoRevisions(resource.id.clone()))?;
        tracing::debug!(blueprint_id = %resource.id, revision = %latest, "Polled revision");
        Ok(latest)
    }
}

fn revision_id(item: &Value) -> Option<String> {
    match item.get("revision_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pick the latest revision id: the numerically greatest when every id is
/// numeric, otherwise the last one in response order.
pub fn latest_revision(items: &[Value]) -> Option<String> {
    let ids: Vec<String> = items.iter().filter_map(revision_id).collect();

    let numeric: Option<Vec<(u64, &String)>> = ids
        .iter()
        .map(|id| id.parse::<u64>().ok().map(|n| (n, id)))
        .collect();

    match numeric {
        Some(pairs) => pairs.into_iter().max_by_key(|(n, _)| *n).map(|(_, id)| id.clone()),
        None => ids.last().cloned(),
    }
}
