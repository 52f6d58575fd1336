//! Discovery Query Service
//!
//! Fetches every user whose replica set includes this node, page by page.

use std::time::Duration;

use async_trait::async_trait;

use super::DataEnvelope;
use crate::error::{Error, Result};
use crate::model::{NodeUser, RawNodeUser};

/// Source of replica-set records
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Users with `user_id > prev_user_id`, ordered by user_id, at most
    /// `max_users` of them
    async fn node_users_page(&self, prev_user_id: u64, max_users: usize) -> Result<Vec<RawNodeUser>>;
}

/// HTTP adapter for the discovery node
pub struct HttpUserDirectory {
    base_url: String,
    self_endpoint: String,
    client: reqwest::Client,
}

impl HttpUserDirectory {
    pub fn new(base_url: impl Into<String>, self_endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            self_endpoint: self_endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn node_users_page(&self, prev_user_id: u64, max_users: usize) -> Result<Vec<RawNodeUser>> {
        let url = format!("{}/v1/full/users/content_node/all", self.base_url);
        let prev = prev_user_id.to_string();
        let max = max_users.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("creator_node_endpoint", self.self_endpoint.as_str()),
                ("prev_user_id", prev.as_str()),
                ("max_users", max.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::peer(&self.base_url, e))?;

        if !response.status().is_success() {
            return Err(Error::peer(&self.base_url, format!("HTTP {}", response.status())));
        }

        let envelope: DataEnvelope<Vec<RawNodeUser>> = response.json().await.map_err(|e| {
            Error::DataInconsistency(format!("malformed node users page: {}", e))
        })?;
        Ok(envelope.data)
    }
}

/// Fetch all node users, following pages until a short page. Records that
/// fail conversion are logged and skipped.
pub async fn fetch_all_node_users(
    directory: &dyn UserDirectory,
    page_size: usize,
    allow_legacy: bool,
) -> Result<Vec<NodeUser>> {
    let mut users = Vec::new();
    let mut prev_user_id = 0;

    loop {
        let page = directory.node_users_page(prev_user_id, page_size).await?;
        let page_len = page.len();

        for raw in page {
            if raw.user_id <= prev_user_id && prev_user_id != 0 {
                return Err(Error::DataInconsistency(format!(
                    "discovery returned user {} after {}",
                    raw.user_id, prev_user_id
                )));
            }
            prev_user_id = raw.user_id;

            match NodeUser::from_raw(raw, allow_legacy) {
                Ok(user) => users.push(user),
                Err(e) => tracing::warn!("Skipping node user: {}", e),
            }
        }

        if page_len < page_size {
            break;
        }
    }

    tracing::debug!("Fetched {} node users", users.len());
    Ok(users)
}
