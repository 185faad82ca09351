//! Asset server lookup
//!
//! The asset server indexes every stored file by a fingerprint of its first
//! 4096 bytes and its length (see `ezpump_common::checksum::fingerprint`).

use super::{endpoints, AssetIndex};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

pub struct EasClient {
    client: Client,
    base_url: String,
    instance: String,
}

impl EasClient {
    pub fn new(
        base_url: impl Into<String>,
        instance: impl Into<String>,
        timeout_secs: u64,
        verify_ssl: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            instance: instance.into(),
        })
    }
}

#[async_trait]
impl AssetIndex for EasClient {
    /// Ids of stored assets with this fingerprint
    async fn search(&self, fingerprint: &str) -> Result<Vec<i64>> {
        let url = endpoints::asset_search_url(&self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("instance", self.instance.as_str()),
                ("type.unique_id", fingerprint),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EtlError::api(format!("asset search returned {}: {}", status, body)));
        }

        let found: JsonValue = response.json().await?;
        let Some(entries) = found.as_array() else {
            return Err(EtlError::protocol("asset search response is not an array"));
        };
        let ids = entries
            .iter()
            .map(|entry| match entry.get("id") {
                Some(JsonValue::Number(n)) => n.as_i64(),
                Some(JsonValue::String(s)) => s.parse().ok(),
                _ => None,
            })
            .map(|id| id.ok_or_else(|| EtlError::protocol("asset search entry without id")))
            .collect::<Result<Vec<i64>>>()?;
        debug!(fingerprint, found = ids.len(), "asset search");
        Ok(ids)
    }
}
