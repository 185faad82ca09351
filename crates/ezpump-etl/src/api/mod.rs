//! Remote API clients
//!
//! [`RemoteApi`] is the seam between the loader and the target system;
//! [`EasydbClient`] implements it over HTTP. Asset lookup by fingerprint
//! goes to the asset server through [`AssetIndex`], implemented by
//! [`EasClient`].

pub mod eas;
pub mod easydb;
pub mod endpoints;
pub mod payload;

pub use eas::EasClient;
pub use easydb::EasydbClient;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Default timeout for API requests in seconds
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 300;

/// Remote ids returned for a created object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedObject {
    pub id: i64,
    pub global_object_id: Option<String>,
}

/// Remote ids of a created tag group and its tags, in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTagGroup {
    pub id: i64,
    pub tag_ids: Vec<i64>,
}

/// Root collection the target system keeps for every user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserCollection {
    pub owner_id: i64,
    pub collection_id: i64,
}

/// Calls the loader makes against the target system
///
/// Every batch call returns one entry per request entry, in request order;
/// implementations fail with a protocol error otherwise.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Current user schema (`schema/user/CURRENT`)
    async fn schema(&self) -> Result<JsonValue>;

    /// Base configuration (`config/list`), holding the database languages
    async fn config(&self) -> Result<JsonValue>;

    async fn create_objects(&self, objecttype: &str, objects: &[JsonValue]) -> Result<Vec<CreatedObject>>;

    async fn create_pools(&self, pools: &[JsonValue]) -> Result<Vec<i64>>;

    async fn create_groups(&self, groups: &[JsonValue]) -> Result<Vec<i64>>;

    async fn create_users(&self, users: &[JsonValue]) -> Result<Vec<i64>>;

    async fn create_tag_groups(&self, tag_groups: &[JsonValue]) -> Result<Vec<CreatedTagGroup>>;

    async fn create_collection(&self, collection: &JsonValue) -> Result<i64>;

    async fn add_collection_objects(&self, collection_id: i64, objects: &JsonValue) -> Result<()>;

    /// Id of the pool without parent; resolved once and cached
    async fn root_pool_id(&self) -> Result<i64>;

    async fn user_collections(&self) -> Result<Vec<UserCollection>>;

    /// Upload one file, returning its asset id
    async fn upload_asset(&self, filename: &str, data: Vec<u8>) -> Result<i64>;
}

/// Lookup of already stored assets by content fingerprint
#[async_trait]
pub trait AssetIndex: Send + Sync {
    async fn search(&self, fingerprint: &str) -> Result<Vec<i64>>;
}
