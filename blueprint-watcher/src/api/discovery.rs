//! Blueprint discovery.

use super::{ApiSession, Discovery};
use crate::inventory::Resource;
use crate::utils::errors::ApiError;
use serde::Deserialize;
use std::sync::Arc;

const BLUEPRINTS_PATH: &str = "/api/blueprints";

#[derive(Deserialize)]
struct BlueprintList {
    items: Vec<BlueprintItem>,
}

#[derive(Deserialize)]
struct BlueprintItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

/// Lists blueprints via `GET /api/blueprints`.
pub struct DiscoveryClient {
    session: Arc<ApiSession>,
}

impl DiscoveryClient {
    pub fn new(session: Arc<ApiSession>) -> Self {
        Self { session }
    }
}

impl Discovery for DiscoveryClient {
    async fn discover(&self) -> Result<Vec<Resource>, ApiError> {
        let list: BlueprintList = self.session.get_json(BLUEPRINTS_PATH).await?;

        let resources: Vec<Resource> = list
            .items
            .into_iter()
            .filter_map(|item| {
                let id = item.id.filter(|id| !id.is_empty())?;
                tracing::debug!(blueprint_id = %id, label = ?item.label, "Discovered blueprint");
                Some(Resource::new(id, item.label))
            })
            .collect();

        tracing::info!("Discovered {} blueprint(s)", resources.len());
        Ok(resources)
    }
}
