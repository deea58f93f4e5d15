//! Network inventory gateway.

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::model::{Network, NetworkFilter};

/// Typed access to the network inventory backend.
#[derive(Debug, Clone)]
pub struct NapiClient {
    api: ApiClient,
}

impl NapiClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<Network>, ApiError> {
        self.api.get("/networks", &filter.to_query()).await
    }

    /// First network matching the filter.
    pub async fn first_network(&self, filter: &NetworkFilter) -> Result<Network, ApiError> {
        self.list_networks(filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound("no networks match the filter".to_string()))
    }
}
