//! Asset resolution before push
//!
//! Each row of `asset.<type>.<column>` without `__eas_id` is fetched from its
//! source (filestore blob, local file or URL), looked up on the asset server
//! by fingerprint, and uploaded only if no reusable copy exists. Failures are
//! logged and skip the asset; the owning object is still pushed.

use crate::api::{AssetIndex, RemoteApi};
use crate::destination::Destination;
use crate::error::{EtlError, Result};
use crate::repository::{quote_name, Repository};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::sync::AssetSourceType;
use crate::value::Value;
use ezpump_common::checksum::fingerprint;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Upload attempts per asset
pub const UPLOAD_ATTEMPTS: usize = 3;

pub struct AssetResolver<'a> {
    source: &'a dyn Repository,
    destination: &'a Destination,
    api: &'a dyn RemoteApi,
    index: Option<&'a dyn AssetIndex>,
    http: Client,
    asset_dir: Option<PathBuf>,
}

impl<'a> AssetResolver<'a> {
    pub fn new(
        source: &'a dyn Repository,
        destination: &'a Destination,
        api: &'a dyn RemoteApi,
        http: Client,
    ) -> Self {
        Self {
            source,
            destination,
            api,
            index: None,
            http,
            asset_dir: None,
        }
    }

    /// Search by fingerprint before uploading
    pub fn with_index(mut self, index: Option<&'a dyn AssetIndex>) -> Self {
        self.index = index;
        self
    }

    /// Base directory of relative `filename` sources
    pub fn with_asset_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.asset_dir = dir;
        self
    }

    /// Remote ids of the assets of one object, with the preferred flag
    ///
    /// Only the first asset flagged preferred stays preferred.
    pub async fn resolve(&self, db: &dyn Repository, table: &str, object_id: &str) -> Result<Vec<(i64, bool)>> {
        let sql = format!(
            "SELECT {uid}, source_type, source, __eas_id, preferred, original_filename FROM {table} WHERE object_id = ?1 ORDER BY rowid",
            uid = quote_name(SOURCE_UNIQUE_ID),
            table = quote_name(table)
        );
        let rows = db.query(&sql, &[Value::from(object_id)])?;

        let mut resolved = Vec::with_capacity(rows.len());
        let mut preferred_found = false;
        for row in rows {
            let uid = row.text(SOURCE_UNIQUE_ID).unwrap_or_default();
            let eas_id = match row.integer("__eas_id") {
                Some(id) => id,
                None => {
                    let source_type = row.text("source_type").unwrap_or_default();
                    let source = row.text("source").unwrap_or_default();
                    info!(table, object_id, source_type = %source_type, source = %source, "load asset");

                    let data = match self.fetch(&source_type, &source).await {
                        Ok(data) => data,
                        Err(e) => {
                            error!(table, object_id, source = %source, error = %e, "failed to fetch asset");
                            continue;
                        },
                    };
                    let filename = row.text("original_filename").unwrap_or_else(|| uid.clone());
                    let Some(eas_id) = self.store(db, table, &filename, data).await? else {
                        error!(table, object_id, source_type = %source_type, source = %source, "asset upload failed");
                        continue;
                    };
                    db.execute(
                        &format!(
                            "UPDATE {} SET __eas_id = ?1 WHERE {} = ?2",
                            quote_name(table),
                            quote_name(SOURCE_UNIQUE_ID)
                        ),
                        &[Value::from(eas_id), Value::from(uid.as_str())],
                    )?;
                    eas_id
                },
            };
            let preferred = !preferred_found && row.value("preferred").as_bool().unwrap_or(false);
            preferred_found |= preferred;
            resolved.push((eas_id, preferred));
        }
        Ok(resolved)
    }

    async fn fetch(&self, source_type: &str, source: &str) -> Result<Vec<u8>> {
        match source_type.parse::<AssetSourceType>()? {
            AssetSourceType::Data => {
                let row = self
                    .source
                    .query_one(
                        "SELECT data FROM filestore WHERE filestore_id = ?1",
                        &[Value::from(source)],
                    )?
                    .ok_or_else(|| EtlError::asset(format!("filestore entry {} not found", source)))?;
                match row.value("data") {
                    Value::Blob(data) => Ok(data),
                    Value::Text(text) => Ok(text.into_bytes()),
                    _ => Err(EtlError::asset(format!("filestore entry {} has no data", source))),
                }
            },
            AssetSourceType::Url => {
                let response = self.http.get(source).send().await?;
                if !response.status().is_success() {
                    return Err(EtlError::asset(format!(
                        "fetching {} returned {}",
                        source,
                        response.status()
                    )));
                }
                Ok(response.bytes().await?.to_vec())
            },
            AssetSourceType::Filename => {
                let path = self.local_path(source);
                if !path.is_file() {
                    return Err(EtlError::asset(format!(
                        "asset not found in filesystem: {}",
                        path.display()
                    )));
                }
                Ok(tokio::fs::read(&path).await?)
            },
        }
    }

    fn local_path(&self, source: &str) -> PathBuf {
        let path = Path::new(source);
        match &self.asset_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Reuse a found asset or upload; `None` if every upload attempt failed
    async fn store(&self, db: &dyn Repository, table: &str, filename: &str, data: Vec<u8>) -> Result<Option<i64>> {
        if let Some(id) = self.search(db, table, &data).await? {
            return Ok(Some(id));
        }
        for attempt in 1..=UPLOAD_ATTEMPTS {
            debug!(filename, attempt, "upload asset");
            match self.api.upload_asset(filename, data.clone()).await {
                Ok(id) => {
                    debug!(filename, eas_id = id, "asset uploaded");
                    return Ok(Some(id));
                },
                Err(e) => error!(filename, attempt, error = %e, "asset upload attempt failed"),
            }
        }
        Ok(None)
    }

    async fn search(&self, db: &dyn Repository, table: &str, data: &[u8]) -> Result<Option<i64>> {
        let Some(index) = self.index else {
            return Ok(None);
        };
        let unique_id = fingerprint(data);
        let found = match index.search(&unique_id).await {
            Ok(found) => found,
            Err(e) => {
                error!(fingerprint = %unique_id, error = %e, "asset search failed");
                return Ok(None);
            },
        };

        let valid: Vec<i64> = found
            .into_iter()
            .filter(|id| {
                let consumed = self.destination.consume_asset(*id);
                if !consumed {
                    warn!(eas_id = id, "found asset is not valid");
                }
                consumed
            })
            .collect();
        if valid.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; valid.len()].join(", ");
        let in_use: Vec<i64> = db
            .query(
                &format!(
                    "SELECT __eas_id FROM {} WHERE __eas_id IN ({})",
                    quote_name(table),
                    placeholders
                ),
                &valid.iter().map(|id| Value::from(*id)).collect::<Vec<_>>(),
            )?
            .iter()
            .filter_map(|row| row.integer("__eas_id"))
            .collect();

        for id in valid {
            if in_use.contains(&id) {
                debug!(eas_id = id, "asset found, but already in use");
            } else {
                debug!(eas_id = id, "reusing found asset");
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::EasydbClient;
    use crate::destination::{L10N_FILE, SCHEMA_FILE};
    use crate::repository::SqliteRepository;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ASSETS: &str = "asset.bilder.datei";

    async fn client(server: &MockServer) -> EasydbClient {
        Mock::given(method("GET"))
            .and(path("/api/v1/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t0"})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/session/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t1"})))
            .mount(server)
            .await;
        let client = EasydbClient::new(server.uri(), 5, true).unwrap();
        client.authenticate("root", "secret").await.unwrap();
        client
    }

    fn destination(dir: &TempDir) -> Destination {
        let schema = json!({
            "type": "user",
            "version": 1,
            "tables": [{"name": "bilder", "columns": [{"kind": "column", "name": "datei", "type": "eas"}]}]
        });
        std::fs::write(dir.path().join(SCHEMA_FILE), schema.to_string()).unwrap();
        std::fs::write(dir.path().join(L10N_FILE), json!(["de-DE"]).to_string()).unwrap();
        Destination::open(dir.path()).unwrap()
    }

    /// Asset table with one local file for object `b1`
    fn asset_db(dir: &TempDir) -> SqliteRepository {
        std::fs::write(dir.path().join("scan.tif"), b"pixels").unwrap();
        let db = SqliteRepository::open_in_memory().unwrap();
        db.execute(
            &format!(
                "CREATE TABLE {} ({} TEXT, object_id TEXT, source_type TEXT, source TEXT, \
                 __eas_id INTEGER, preferred INTEGER, original_filename TEXT)",
                quote_name(ASSETS),
                quote_name(SOURCE_UNIQUE_ID)
            ),
            &[],
        )
        .unwrap();
        db.execute(
            &format!(
                "INSERT INTO {} VALUES ('a1', 'b1', 'filename', 'scan.tif', NULL, 1, 'scan.tif')",
                quote_name(ASSETS)
            ),
            &[],
        )
        .unwrap();
        db
    }

    fn eas_id(db: &SqliteRepository) -> Option<i64> {
        db.extract_table(ASSETS).unwrap()[0].integer("__eas_id")
    }

    #[tokio::test]
    async fn test_upload_is_retried_until_it_succeeds() {
        let server = MockServer::start().await;
        let api = client(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/eas/put"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/eas/put"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"_id": 77}])))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let source = SqliteRepository::open_in_memory().unwrap();
        let db = asset_db(&dir);
        let resolver = AssetResolver::new(&source, &destination, &api, Client::new())
            .with_asset_dir(Some(dir.path().to_path_buf()));

        let resolved = resolver.resolve(&db, ASSETS, "b1").await.unwrap();
        assert_eq!(resolved, vec![(77, true)]);
        assert_eq!(eas_id(&db), Some(77));

        let uploads = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/v1/eas/put")
            .count();
        assert_eq!(uploads, UPLOAD_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_asset_is_skipped_after_last_failed_attempt() {
        let server = MockServer::start().await;
        let api = client(&server).await;
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let source = SqliteRepository::open_in_memory().unwrap();
        let db = asset_db(&dir);
        let resolver = AssetResolver::new(&source, &destination, &api, Client::new())
            .with_asset_dir(Some(dir.path().to_path_buf()));

        {
            let _uploads = Mock::given(method("POST"))
                .and(path("/api/v1/eas/put"))
                .respond_with(ResponseTemplate::new(500))
                .expect(UPLOAD_ATTEMPTS as u64)
                .mount_as_scoped(&server)
                .await;
            let stored = resolver.store(&db, ASSETS, "scan.tif", b"pixels".to_vec()).await;
            assert_eq!(stored.unwrap(), None);
        }

        // the owning object still loads; the asset stays unresolved
        let _uploads = Mock::given(method("POST"))
            .and(path("/api/v1/eas/put"))
            .respond_with(ResponseTemplate::new(500))
            .expect(UPLOAD_ATTEMPTS as u64)
            .mount_as_scoped(&server)
            .await;
        let resolved = resolver.resolve(&db, ASSETS, "b1").await.unwrap();
        assert!(resolved.is_empty());
        assert_eq!(eas_id(&db), None);
    }
}
