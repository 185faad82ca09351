//! HTTP client for the target system API
//!
//! A session token is obtained with [`EasydbClient::authenticate`] and sent as
//! the `token` query parameter on every later call. Any non-success status
//! is an [`EtlError::Api`] carrying the response body.

use super::{endpoints, CreatedObject, CreatedTagGroup, RemoteApi, UserCollection};
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value as JsonValue};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// Response helpers
// ============================================================================

/// Integer at `pointer` (e.g. `/pool/_id`) of a response entry
pub(crate) fn id_at(entry: &JsonValue, pointer: &str) -> Result<i64> {
    entry
        .pointer(pointer)
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| EtlError::protocol(format!("response entry has no integer at {}: {}", pointer, entry)))
}

/// Response array, which must have one entry per request entry
pub(crate) fn matched_entries(what: &str, response: JsonValue, expected: usize) -> Result<Vec<JsonValue>> {
    let JsonValue::Array(entries) = response else {
        return Err(EtlError::protocol(format!("{}: response is not an array", what)));
    };
    if entries.len() != expected {
        return Err(EtlError::protocol(format!(
            "{}: response has {} entries for {} pushed",
            what,
            entries.len(),
            expected
        )));
    }
    Ok(entries)
}

async fn parsed(method: &str, url: &str, request: RequestBuilder) -> Result<JsonValue> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EtlError::api(format!("{} {} returned {}: {}", method, url, status, body)));
    }
    Ok(response.json().await?)
}

/// Client for one target system instance
pub struct EasydbClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
    root_pool: Mutex<Option<i64>>,
}

impl EasydbClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64, verify_ssl: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token: Mutex::new(None),
            root_pool: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Open a session and authenticate it with `login` / `password`
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<()> {
        info!(url = %self.base_url, login, "authenticate");
        let url = endpoints::session_url(&self.base_url);
        let session = parsed("GET", &url, self.client.get(&url)).await?;
        let token = session_token(&session)?;

        let url = endpoints::authenticate_url(&self.base_url);
        let request = self
            .client
            .post(&url)
            .query(&[("token", token.as_str()), ("login", login), ("password", password)]);
        let session = parsed("POST", &url, request).await?;
        let token = session_token(&session)?;

        *self
            .token
            .lock()
            .map_err(|_| EtlError::api("session lock poisoned"))? = Some(token);
        Ok(())
    }

    fn token(&self) -> Result<String> {
        self.token
            .lock()
            .map_err(|_| EtlError::api("session lock poisoned"))?
            .clone()
            .ok_or_else(|| EtlError::api("client is not authenticated"))
    }

    async fn get(&self, url: &str) -> Result<JsonValue> {
        debug!(url, "GET");
        let request = self.client.get(url).query(&[("token", self.token()?)]);
        parsed("GET", url, request).await
    }

    async fn post(&self, url: &str, body: &JsonValue, params: &[(&str, &str)]) -> Result<JsonValue> {
        debug!(url, ?params, "POST");
        let request = self
            .client
            .post(url)
            .query(&[("token", self.token()?)])
            .query(params)
            .json(body);
        parsed("POST", url, request).await
    }

    async fn put(&self, url: &str, body: &JsonValue) -> Result<JsonValue> {
        debug!(url, "PUT");
        let request = self
            .client
            .put(url)
            .query(&[("token", self.token()?)])
            .json(body);
        parsed("PUT", url, request).await
    }

    async fn create_batch(&self, what: &str, url: &str, entries: &[JsonValue], id_pointer: &str) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.post(url, &JsonValue::from(entries.to_vec()), &[]).await?;
        matched_entries(what, response, entries.len())?
            .iter()
            .map(|entry| id_at(entry, id_pointer))
            .collect()
    }
}

fn session_token(session: &JsonValue) -> Result<String> {
    session
        .get("token")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| EtlError::protocol("session response has no token"))
}

#[async_trait]
impl RemoteApi for EasydbClient {
    async fn schema(&self) -> Result<JsonValue> {
        let url = endpoints::schema_url(&self.base_url);
        let request = self
            .client
            .get(&url)
            .query(&[("token", self.token()?.as_str()), ("format", "json")]);
        parsed("GET", &url, request).await
    }

    async fn config(&self) -> Result<JsonValue> {
        self.get(&endpoints::config_url(&self.base_url)).await
    }

    async fn create_objects(&self, objecttype: &str, objects: &[JsonValue]) -> Result<Vec<CreatedObject>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let url = endpoints::objects_url(&self.base_url, objecttype);
        let response = self
            .post(
                &url,
                &JsonValue::from(objects.to_vec()),
                &[("priority", "-1"), ("format", "short")],
            )
            .await?;
        let id_pointer = format!("/{}/_id", objecttype);
        matched_entries(objecttype, response, objects.len())?
            .iter()
            .map(|entry| {
                Ok(CreatedObject {
                    id: id_at(entry, &id_pointer)?,
                    global_object_id: entry
                        .get("_global_object_id")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                })
            })
            .collect()
    }

    async fn create_pools(&self, pools: &[JsonValue]) -> Result<Vec<i64>> {
        self.create_batch("pools", &endpoints::pool_url(&self.base_url), pools, "/pool/_id")
            .await
    }

    async fn create_groups(&self, groups: &[JsonValue]) -> Result<Vec<i64>> {
        self.create_batch("groups", &endpoints::group_url(&self.base_url), groups, "/group/_id")
            .await
    }

    async fn create_users(&self, users: &[JsonValue]) -> Result<Vec<i64>> {
        self.create_batch("users", &endpoints::user_url(&self.base_url), users, "/user/_id")
            .await
    }

    async fn create_tag_groups(&self, tag_groups: &[JsonValue]) -> Result<Vec<CreatedTagGroup>> {
        if tag_groups.is_empty() {
            return Ok(Vec::new());
        }
        let url = endpoints::tags_url(&self.base_url);
        let response = self.post(&url, &JsonValue::from(tag_groups.to_vec()), &[]).await?;
        let entries = matched_entries("tag groups", response, tag_groups.len())?;

        entries
            .iter()
            .zip(tag_groups)
            .map(|(entry, request)| {
                let pushed = request
                    .get("_tags")
                    .and_then(JsonValue::as_array)
                    .map_or(0, Vec::len);
                let tags = matched_entries(
                    "tags",
                    entry.get("_tags").cloned().unwrap_or(JsonValue::Array(Vec::new())),
                    pushed,
                )?;
                Ok(CreatedTagGroup {
                    id: id_at(entry, "/taggroup/_id")?,
                    tag_ids: tags
                        .iter()
                        .map(|tag| id_at(tag, "/tag/_id"))
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect()
    }

    async fn create_collection(&self, collection: &JsonValue) -> Result<i64> {
        let response = self
            .put(&endpoints::collection_url(&self.base_url), collection)
            .await?;
        id_at(&response, "/collection/_id")
    }

    async fn add_collection_objects(&self, collection_id: i64, objects: &JsonValue) -> Result<()> {
        let url = endpoints::collection_objects_url(&self.base_url, collection_id);
        self.post(&url, objects, &[]).await?;
        Ok(())
    }

    async fn root_pool_id(&self) -> Result<i64> {
        if let Some(id) = *self
            .root_pool
            .lock()
            .map_err(|_| EtlError::api("root pool lock poisoned"))?
        {
            return Ok(id);
        }

        let query = json!({
            "type": "pool",
            "search": [{"type": "in", "fields": ["pool._id_parent"], "in": [null]}]
        });
        let response = self
            .post(&endpoints::search_url(&self.base_url), &query, &[])
            .await?;
        let root = response
            .pointer("/objects/0")
            .ok_or_else(|| EtlError::protocol("failed to retrieve root pool"))?;
        let id = id_at(root, "/pool/_id")?;
        info!(root_pool = id, "resolved root pool");

        *self
            .root_pool
            .lock()
            .map_err(|_| EtlError::api("root pool lock poisoned"))? = Some(id);
        Ok(id)
    }

    async fn user_collections(&self) -> Result<Vec<UserCollection>> {
        let roots = self
            .get(&endpoints::collection_list_url(&self.base_url, None))
            .await?;
        let root = roots
            .get(0)
            .ok_or_else(|| EtlError::protocol("collection list is empty"))?;
        let root_id = id_at(root, "/collection/_id")?;

        let children = self
            .get(&endpoints::collection_list_url(&self.base_url, Some(root_id)))
            .await?;
        let Some(children) = children.as_array() else {
            return Err(EtlError::protocol("collection list is not an array"));
        };
        children
            .iter()
            .filter(|c| c.pointer("/_owner/_basetype").and_then(JsonValue::as_str) == Some("user"))
            .map(|c| {
                Ok(UserCollection {
                    owner_id: id_at(c, "/_owner/user/_id")?,
                    collection_id: id_at(c, "/collection/_id")?,
                })
            })
            .collect()
    }

    async fn upload_asset(&self, filename: &str, data: Vec<u8>) -> Result<i64> {
        let url = endpoints::asset_upload_url(&self.base_url);
        debug!(url = %url, filename, bytes = data.len(), "upload asset");
        let form = Form::new().part("files[]", Part::bytes(data).file_name(filename.to_string()));
        let request = self
            .client
            .post(&url)
            .query(&[("token", self.token()?)])
            .multipart(form);
        let response = parsed("POST", &url, request).await?;
        let uploaded = matched_entries("asset upload", response, 1)?;
        id_at(&uploaded[0], "/_id")
    }
}
