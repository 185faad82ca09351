//! Content-addressed asset store
//!
//! `filestore` holds one row per distinct content (`unique_id`), `file` rows
//! attach that content to a source row and column. Storing the same content
//! again only adds a `file` row.

use crate::error::{EtlError, Result};
use crate::intermediate::{IntermediateStore, FILESTORE_TABLE, FILE_TABLE};
use crate::repository::Repository;
use crate::value::{Row, Value};
use ezpump_common::checksum::content_id_of;
use reqwest::Client;
use std::path::Path;
use tracing::{debug, warn};

/// What a `filestore` row keeps of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// The bytes themselves
    Data,
    /// The remote URL
    Url,
    /// The local file path
    File,
}

impl std::str::FromStr for StorageMode {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(StorageMode::Data),
            "url" => Ok(StorageMode::Url),
            "file" | "filename" => Ok(StorageMode::File),
            other => Err(EtlError::config(format!(
                "unknown storage mode '{}' (expected data, url or file)",
                other
            ))),
        }
    }
}

/// One asset to store for a source row
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRequest {
    pub source_name: String,
    pub table: String,
    pub column: String,
    pub source_unique_id: String,
    /// HTTP(S) URL or local path
    pub location: String,
    /// Caller- or remote-supplied content id; derived by hashing otherwise
    pub unique_id: Option<String>,
    pub modes: Vec<StorageMode>,
    pub original_filename: Option<String>,
    pub mimetype: Option<String>,
    pub version: Option<String>,
    /// Remote asset id, when the asset already exists remotely
    pub eas_id: Option<i64>,
    /// Original this asset is a derivative of
    pub root: Option<Box<AssetRequest>>,
}

impl AssetRequest {
    pub fn new(
        source_name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        source_unique_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            table: table.into(),
            column: column.into(),
            source_unique_id: source_unique_id.into(),
            location: location.into(),
            unique_id: None,
            modes: vec![StorageMode::Data],
            original_filename: None,
            mimetype: None,
            version: None,
            eas_id: None,
            root: None,
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_modes(mut self, modes: Vec<StorageMode>) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_eas_id(mut self, eas_id: i64) -> Self {
        self.eas_id = Some(eas_id);
        self
    }

    pub fn with_root(mut self, root: AssetRequest) -> Self {
        self.root = Some(Box::new(root));
        self
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    fn wants(&self, mode: StorageMode) -> bool {
        self.modes.contains(&mode)
    }

    fn filename(&self) -> Option<String> {
        self.original_filename.clone().or_else(|| {
            let trimmed = self.location.split(['?', '#']).next().unwrap_or_default();
            trimmed
                .rsplit(['/', '\\'])
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}

/// Rows written (or reused) for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredAsset {
    pub filestore_id: i64,
    pub file_id: i64,
    /// Content was already present and not fetched again
    pub reused: bool,
}

/// Fetched content and its metadata
struct Fetched {
    data: Option<Vec<u8>>,
    size: Option<i64>,
    mimetype: Option<String>,
}

pub struct AssetStore<'a> {
    store: &'a IntermediateStore,
    client: Client,
}

impl<'a> AssetStore<'a> {
    pub fn new(store: &'a IntermediateStore) -> Self {
        Self {
            store,
            client: Client::new(),
        }
    }

    pub fn with_client(store: &'a IntermediateStore, client: Client) -> Self {
        Self { store, client }
    }

    /// Store an asset and its root chain, roots first
    ///
    /// Returns `None` when the content could not be fetched; the failure is
    /// logged and nothing is written for this asset.
    pub async fn store(&self, request: &AssetRequest) -> Result<Option<StoredAsset>> {
        let mut chain: Vec<&AssetRequest> = Vec::new();
        let mut next = Some(request);
        while let Some(current) = next {
            chain.push(current);
            next = current.root.as_deref();
        }

        let mut root_ref: Option<i64> = None;
        let mut stored = None;
        for current in chain.into_iter().rev() {
            stored = match self.store_one(current, root_ref).await? {
                Some(asset) => Some(asset),
                None => return Ok(None),
            };
            root_ref = match (current.eas_id, stored) {
                (Some(eas_id), _) => Some(eas_id),
                (None, Some(asset)) => Some(asset.file_id),
                (None, None) => None,
            };
        }
        Ok(stored)
    }

    async fn store_one(
        &self,
        request: &AssetRequest,
        eas_root_id: Option<i64>,
    ) -> Result<Option<StoredAsset>> {
        let repo = self.store.repo();

        let mut fetched = None;
        let unique_id = match &request.unique_id {
            Some(id) => id.clone(),
            None if request.wants(StorageMode::Data) => {
                let Some(content) = self.fetch_or_skip(request).await? else {
                    return Ok(None);
                };
                let id = content
                    .data
                    .as_deref()
                    .map(content_id_of)
                    .unwrap_or_else(|| content_id_of(request.location.as_bytes()));
                fetched = Some(content);
                id
            },
            None => content_id_of(request.location.as_bytes()),
        };

        let existing = repo
            .query_one(
                "SELECT filestore_id FROM filestore WHERE unique_id = ?1",
                &[Value::from(unique_id.as_str())],
            )?
            .and_then(|r| r.integer("filestore_id"));

        let (filestore_id, reused) = match existing {
            Some(id) => {
                debug!(unique_id = %unique_id, filestore_id = id, "reusing stored content");
                (id, true)
            },
            None => {
                let content = match fetched {
                    Some(content) => content,
                    None => match self.fetch_or_skip(request).await? {
                        Some(content) => content,
                        None => return Ok(None),
                    },
                };
                let row = Row::new()
                    .with("unique_id", unique_id.as_str())
                    .with("original_filename", request.filename())
                    .with("mimetype", request.mimetype.clone().or(content.mimetype))
                    .with("filesize", content.size)
                    .with(
                        "url",
                        (request.is_remote() && request.wants(StorageMode::Url))
                            .then(|| request.location.clone()),
                    )
                    .with(
                        "filename",
                        (!request.is_remote() && request.wants(StorageMode::File))
                            .then(|| request.location.clone()),
                    )
                    .with("data", content.data);
                (repo.insert_row(FILESTORE_TABLE, &row)?, false)
            },
        };

        let file_id = repo.insert_row(
            FILE_TABLE,
            &Row::new()
                .with("filestore_id", filestore_id)
                .with("source_name", request.source_name.as_str())
                .with("source_table_name", request.table.as_str())
                .with("source_column_name", request.column.as_str())
                .with("source_unique_id", request.source_unique_id.as_str())
                .with("origin_url", request.location.as_str())
                .with("eas_id", request.eas_id)
                .with("eas_root_id", eas_root_id)
                .with("file_version", request.version.clone()),
        )?;

        Ok(Some(StoredAsset {
            filestore_id,
            file_id,
            reused,
        }))
    }

    async fn fetch_or_skip(&self, request: &AssetRequest) -> Result<Option<Fetched>> {
        match self.fetch(request).await {
            Ok(content) => Ok(Some(content)),
            Err(e @ (EtlError::Http(_) | EtlError::Io(_) | EtlError::Asset(_))) => {
                warn!(location = %request.location, error = %e, "could not fetch asset, skipped");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Bytes (only when `data` is requested) and size of the asset
    async fn fetch(&self, request: &AssetRequest) -> Result<Fetched> {
        let want_data = request.wants(StorageMode::Data);
        if request.is_remote() {
            if !want_data {
                return Ok(Fetched {
                    data: None,
                    size: None,
                    mimetype: None,
                });
            }
            let response = self
                .client
                .get(&request.location)
                .send()
                .await?
                .error_for_status()?;
            let mimetype = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response.bytes().await?.to_vec();
            return Ok(Fetched {
                size: Some(bytes.len() as i64),
                data: Some(bytes),
                mimetype,
            });
        }

        let path = Path::new(&request.location);
        if !path.is_file() {
            return Err(EtlError::asset(format!("not a file: {}", path.display())));
        }
        let size = tokio::fs::metadata(path).await?.len() as i64;
        let data = if want_data {
            Some(tokio::fs::read(path).await?)
        } else {
            None
        };
        Ok(Fetched {
            data,
            size: Some(size),
            mimetype: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn count(store: &IntermediateStore, table: &str) -> usize {
        store.repo().extract_table(table).unwrap().len()
    }

    #[tokio::test]
    async fn test_same_content_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("scan.tif");
        std::fs::write(&file, b"pixels").unwrap();
        let store = IntermediateStore::in_memory().unwrap();
        let assets = AssetStore::new(&store);

        let location = file.display().to_string();
        let first = assets
            .store(&AssetRequest::new("fotos", "bild", "datei", "1", location.as_str()))
            .await
            .unwrap()
            .unwrap();
        let second = assets
            .store(&AssetRequest::new("fotos", "bild", "datei", "2", location.as_str()))
            .await
            .unwrap()
            .unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.filestore_id, second.filestore_id);
        assert_eq!(count(&store, "filestore"), 1);
        assert_eq!(count(&store, "file"), 2);

        let row = store.repo().extract_table("filestore").unwrap().remove(0);
        assert_eq!(row.text("unique_id").unwrap(), content_id_of(b"pixels"));
        assert_eq!(row.text("original_filename").as_deref(), Some("scan.tif"));
        assert_eq!(row.integer("filesize"), Some(6));
    }

    #[tokio::test]
    async fn test_http_fetch_and_missing_file_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/1.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"jpeg".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = IntermediateStore::in_memory().unwrap();
        let assets = AssetStore::new(&store);
        let stored = assets
            .store(
                &AssetRequest::new("s", "t", "c", "1", format!("{}/img/1.jpg", server.uri()))
                    .with_modes(vec![StorageMode::Data, StorageMode::Url]),
            )
            .await
            .unwrap();
        assert!(stored.is_some());
        let row = store.repo().extract_table("filestore").unwrap().remove(0);
        assert_eq!(row.text("mimetype").as_deref(), Some("image/jpeg"));
        assert!(row.text("url").unwrap().ends_with("/img/1.jpg"));
        assert_eq!(row.get("data").and_then(Value::as_blob), Some(&b"jpeg"[..]));

        let missing = assets
            .store(&AssetRequest::new("s", "t", "c", "2", format!("{}/img/gone.jpg", server.uri())))
            .await
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(count(&store, "file"), 1);
    }

    #[tokio::test]
    async fn test_root_is_stored_first() {
        let store = IntermediateStore::in_memory().unwrap();
        let assets = AssetStore::new(&store);
        let original = AssetRequest::new("s", "t", "c", "1", "https://example.org/a.tif")
            .with_modes(vec![StorageMode::Url])
            .with_unique_id("orig")
            .with_eas_id(10)
            .with_version("original");
        let thumb = AssetRequest::new("s", "t", "c", "1", "https://example.org/a_small.jpg")
            .with_modes(vec![StorageMode::Url])
            .with_unique_id("small")
            .with_eas_id(11)
            .with_version("small")
            .with_root(original);

        assets.store(&thumb).await.unwrap().unwrap();

        let files = store.repo().extract_table("file").unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].integer("eas_id"), Some(10));
        assert!(files[0].value("eas_root_id").is_null());
        assert_eq!(files[1].integer("eas_root_id"), Some(10));
    }
}
