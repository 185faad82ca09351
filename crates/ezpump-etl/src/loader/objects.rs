//! Generic object loading
//!
//! Objects are pushed in batches of ids whose remote id is still unset. For
//! hierarchical types only objects whose parent already has a remote id are
//! selected, so trees are created top-down over several rounds.
//!
//! Link columns are resolved once, when the linking object is pushed. A link
//! to an object type loaded later, or a non-hierarchical link within the same
//! type, whose target has no remote id yet is sent as null and logged; no
//! later pass updates it. Load link targets first to keep such links.

use super::assets::AssetResolver;
use super::query::{link_source_name, JoinPlan};
use super::{LoadOptions, LoadReport};
use crate::api::payload::{asset_value, field_value, l10n_map, ObjectPayload};
use crate::api::RemoteApi;
use crate::destination::schema::TAG_TYPE;
use crate::destination::{
    asset_table_name, object_table_name, tag_table_name, ColumnKind, Destination, ObjectType,
    EASYDB_GOID, EASYDB_ID,
};
use crate::error::{EtlError, Result};
use crate::repository::{quote_name, Repository};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::value::{Row, Value};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

pub struct ObjectLoader<'a> {
    destination: &'a Destination,
    api: &'a dyn RemoteApi,
    assets: &'a AssetResolver<'a>,
    objecttype: &'a ObjectType,
    plan: JoinPlan,
    options: &'a LoadOptions,
}

impl<'a> ObjectLoader<'a> {
    pub fn new(
        destination: &'a Destination,
        api: &'a dyn RemoteApi,
        assets: &'a AssetResolver<'a>,
        objecttype: &'a ObjectType,
        options: &'a LoadOptions,
    ) -> Result<Self> {
        let table = destination.table_for_objecttype(&objecttype.name)?;
        let plan = JoinPlan::build(objecttype, table, destination.languages())?;
        Ok(Self {
            destination,
            api,
            assets,
            objecttype,
            plan,
            options,
        })
    }

    /// Push every object of the type that has no remote id yet
    pub async fn load(&self, db: &dyn Repository) -> Result<LoadReport> {
        let name = &self.objecttype.name;
        info!(objecttype = %name, "load objects");
        let mut report = LoadReport::default();
        let mut failed: HashSet<String> = HashSet::new();

        loop {
            let ids = self.next_ids(db, &failed)?;
            if ids.is_empty() {
                break;
            }
            report.batches += 1;
            debug!(objecttype = %name, batch = report.batches, objects = ids.len(), "load batch");

            match self.load_batch(db, &ids).await {
                Ok(pushed) => report.pushed += pushed,
                Err(e) => {
                    error!(objecttype = %name, error = %e, "batch failed");
                    if self.options.stop_on_error || e.is_fatal() {
                        return Err(e);
                    }
                    report.failed += ids.len();
                    failed.extend(ids);
                },
            }
        }
        info!(objecttype = %name, pushed = report.pushed, failed = report.failed, "objects loaded");
        Ok(report)
    }

    fn next_ids(&self, db: &dyn Repository, failed: &HashSet<String>) -> Result<Vec<String>> {
        let table = quote_name(&object_table_name(&self.objecttype.name));
        let uid = quote_name(SOURCE_UNIQUE_ID);
        let mut sql = format!(
            "SELECT t.{uid} AS id FROM {table} t WHERE t.{id} IS NULL",
            id = quote_name(EASYDB_ID)
        );
        if self.objecttype.is_hierarchical {
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM {table} p WHERE p.{uid} = t.\"__parent_id\" AND p.{id} IS NULL)",
                id = quote_name(EASYDB_ID)
            ));
        }
        sql.push_str(&format!(" ORDER BY t.{uid} LIMIT ?1"));
        let limit = (self.options.batch_size + failed.len()) as i64;

        Ok(db
            .query(&sql, &[Value::from(limit)])?
            .into_iter()
            .filter_map(|row| row.text("id"))
            .filter(|id| !failed.contains(id))
            .take(self.options.batch_size)
            .collect())
    }

    async fn load_batch(&self, db: &dyn Repository, ids: &[String]) -> Result<usize> {
        let params: Vec<Value> = ids.iter().map(Value::from).collect();
        let rows = db.query(&self.plan.sql_for_ids(ids.len()), &params)?;

        let mut objects = Vec::with_capacity(ids.len());
        for row in fold_rows(rows) {
            objects.push(self.build_object(db, &row).await?);
        }
        self.push(db, objects).await
    }

    async fn build_object(&self, db: &dyn Repository, row: &Row) -> Result<ObjectPayload> {
        let source_id = row.text(SOURCE_UNIQUE_ID).unwrap_or_default();
        let mut object = ObjectPayload::new(self.objecttype, source_id.as_str()).with_mask(row.text("__mask"));
        object.comment = row.text("__comment");
        object.pool_id = row.integer("__pool_id");
        object.parent_id = row.integer("__parent_id");

        self.fill_fields(db, self.objecttype, row, &source_id, &mut object).await?;
        if self.objecttype.has_tags {
            object.tags = self.tag_ids(db, &source_id)?;
        }
        Ok(object)
    }

    /// Field values of `row`, including assets and nested objects
    async fn fill_fields(
        &self,
        db: &dyn Repository,
        objecttype: &ObjectType,
        row: &Row,
        source_id: &str,
        object: &mut ObjectPayload,
    ) -> Result<()> {
        let languages = self.destination.languages();
        for column in &objecttype.columns {
            match &column.kind {
                ColumnKind::Link { other_table } => {
                    for nested in self.nested_objects(db, other_table, source_id).await? {
                        object.push_nested(&column.name, nested.to_nested_json());
                    }
                },
                ColumnKind::Column(_) if column.is_eas() => {
                    let table = asset_table_name(&objecttype.name, &column.name);
                    let assets = self.assets.resolve(db, &table, source_id).await?;
                    object.set_field(column.name.as_str(), asset_value(&assets));
                },
                ColumnKind::Column(_) if column.is_l10n() => {
                    object.set_field(column.name.as_str(), l10n_map(row, &column.name, languages));
                },
                ColumnKind::Column(_) => {
                    let value = row.value(&column.name);
                    let target = objecttype.link_target(&column.name);
                    if column.is_link_column() && value.is_null() {
                        let linked = row.value(&link_source_name(&column.name));
                        if !linked.is_null() {
                            warn!(
                                objecttype = %objecttype.name,
                                object = source_id,
                                column = %column.name,
                                linked_type = target.unwrap_or_default(),
                                linked = %linked,
                                "link target has no remote id yet, link is sent as null"
                            );
                        }
                    }
                    object.set_field(column.name.as_str(), field_value(column, &value, target)?);
                },
            }
        }
        Ok(())
    }

    /// Owned objects of `objecttype` whose `__uplink_id` is `owner_id`
    async fn nested_objects(&self, db: &dyn Repository, objecttype: &str, owner_id: &str) -> Result<Vec<ObjectPayload>> {
        let nested_type = self.destination.objecttype(objecttype)?;
        let table = self.destination.table_for_objecttype(objecttype)?;
        let plan = JoinPlan::build_nested(nested_type, table, self.destination.languages())?;
        let rows = db.query(&plan.sql_for_owner()?, &[Value::from(owner_id)])?;

        let mut nested = Vec::with_capacity(rows.len());
        for row in fold_rows(rows) {
            let source_id = row.text(SOURCE_UNIQUE_ID).unwrap_or_default();
            let mut object = ObjectPayload::new(nested_type, source_id.as_str());
            Box::pin(self.fill_fields(db, nested_type, &row, &source_id, &mut object)).await?;
            nested.push(object);
        }
        Ok(nested)
    }

    fn tag_ids(&self, db: &dyn Repository, source_id: &str) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT b.{id} AS id FROM {tags} a JOIN {tag} b ON a.tag_id = b.{uid} WHERE a.object_id = ?1 AND b.{id} IS NOT NULL",
            id = quote_name(EASYDB_ID),
            uid = quote_name(SOURCE_UNIQUE_ID),
            tags = quote_name(&tag_table_name(&self.objecttype.name)),
            tag = quote_name(&object_table_name(TAG_TYPE)),
        );
        Ok(db
            .query(&sql, &[Value::from(source_id)])?
            .iter()
            .filter_map(|row| row.integer("id"))
            .collect())
    }

    async fn push(&self, db: &dyn Repository, objects: Vec<ObjectPayload>) -> Result<usize> {
        let name = &self.objecttype.name;
        let payloads = objects
            .iter()
            .map(ObjectPayload::to_json)
            .collect::<Result<Vec<_>>>()?;
        info!(objecttype = %name, objects = payloads.len(), "push");
        let created = self.api.create_objects(name, &payloads).await?;
        if created.len() != objects.len() {
            return Err(EtlError::protocol(format!(
                "{}: {} objects created for {} pushed",
                name,
                created.len(),
                objects.len()
            )));
        }

        let sql = format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE {} = ?3",
            quote_name(&object_table_name(name)),
            quote_name(EASYDB_ID),
            quote_name(EASYDB_GOID),
            quote_name(SOURCE_UNIQUE_ID)
        );
        for (object, remote) in objects.iter().zip(&created) {
            let updated = db.execute(
                &sql,
                &[
                    Value::from(remote.id),
                    Value::from(remote.global_object_id.clone()),
                    Value::from(object.source_id.as_str()),
                ],
            )?;
            if updated != 1 {
                return Err(EtlError::Integrity(format!(
                    "could not store remote id {} for {} '{}'",
                    remote.id, name, object.source_id
                )));
            }
        }
        debug!(objecttype = %name, objects = created.len(), "push end");
        Ok(created.len())
    }
}

/// Keep the first of consecutive rows sharing a source id
pub fn fold_rows(rows: Vec<Row>) -> Vec<Row> {
    let mut folded: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let same = folded
            .last()
            .is_some_and(|last| last.get(SOURCE_UNIQUE_ID) == row.get(SOURCE_UNIQUE_ID));
        if !same {
            folded.push(row);
        }
    }
    folded
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::{CreatedObject, CreatedTagGroup, UserCollection};
    use crate::destination::{CreatePolicy, L10N_FILE, SCHEMA_FILE};
    use crate::repository::SqliteRepository;
    use async_trait::async_trait;
    use reqwest::Client;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Creates objects with increasing ids; batches holding `reject` fail
    struct ObjectApi {
        next_id: AtomicI64,
        batches: Mutex<Vec<Vec<JsonValue>>>,
        reject: Option<&'static str>,
    }

    impl ObjectApi {
        fn new(reject: Option<&'static str>) -> Self {
            Self {
                next_id: AtomicI64::new(100),
                batches: Mutex::new(Vec::new()),
                reject,
            }
        }

        /// `titel` of every pushed object, per batch
        fn titles(&self, objecttype: &str) -> Vec<Vec<String>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|batch| {
                    batch
                        .iter()
                        .map(|o| o[objecttype]["titel"].as_str().unwrap_or_default().to_string())
                        .collect()
                })
                .collect()
        }

        fn pushed(&self, objecttype: &str, titel: &str) -> JsonValue {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .find(|o| o[objecttype]["titel"] == titel)
                .map(|o| o[objecttype].clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl RemoteApi for ObjectApi {
        async fn schema(&self) -> Result<JsonValue> {
            unreachable!()
        }
        async fn config(&self) -> Result<JsonValue> {
            unreachable!()
        }
        async fn create_objects(&self, objecttype: &str, objects: &[JsonValue]) -> Result<Vec<CreatedObject>> {
            self.batches.lock().unwrap().push(objects.to_vec());
            if let Some(reject) = self.reject {
                if objects.iter().any(|o| o[objecttype]["titel"] == reject) {
                    return Err(EtlError::api(format!("{} rejected", reject)));
                }
            }
            Ok(objects
                .iter()
                .map(|_| {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    CreatedObject {
                        id,
                        global_object_id: Some(format!("{}@test", id)),
                    }
                })
                .collect())
        }
        async fn create_pools(&self, _: &[JsonValue]) -> Result<Vec<i64>> {
            unreachable!()
        }
        async fn create_groups(&self, _: &[JsonValue]) -> Result<Vec<i64>> {
            unreachable!()
        }
        async fn create_users(&self, _: &[JsonValue]) -> Result<Vec<i64>> {
            unreachable!()
        }
        async fn create_tag_groups(&self, _: &[JsonValue]) -> Result<Vec<CreatedTagGroup>> {
            unreachable!()
        }
        async fn create_collection(&self, _: &JsonValue) -> Result<i64> {
            unreachable!()
        }
        async fn add_collection_objects(&self, _: i64, _: &JsonValue) -> Result<()> {
            unreachable!()
        }
        async fn root_pool_id(&self) -> Result<i64> {
            unreachable!()
        }
        async fn user_collections(&self) -> Result<Vec<UserCollection>> {
            unreachable!()
        }
        async fn upload_asset(&self, _: &str, _: Vec<u8>) -> Result<i64> {
            unreachable!()
        }
    }

    fn destination(dir: &TempDir) -> Destination {
        let schema = json!({
            "type": "user",
            "version": 1,
            "tables": [
                {
                    "name": "ordner",
                    "is_hierarchical": true,
                    "columns": [
                        {"kind": "column", "name": "titel", "type": "text"},
                        {"kind": "column", "name": "fotograf", "type": "link"}
                    ],
                    "foreign_keys": [{
                        "columns": [{"column_name_hint": "fotograf"}],
                        "referenced_table": {
                            "name_hint": "person",
                            "columns": [{"auto_column_primary_key": true}]
                        }
                    }]
                },
                {"name": "person", "columns": [{"kind": "column", "name": "titel", "type": "text"}]}
            ]
        });
        std::fs::write(dir.path().join(SCHEMA_FILE), schema.to_string()).unwrap();
        std::fs::write(dir.path().join(L10N_FILE), json!(["de-DE"]).to_string()).unwrap();
        let destination = Destination::open(dir.path()).unwrap();
        destination.create(CreatePolicy::Always, &[]).unwrap();
        destination
    }

    fn insert(db: &SqliteRepository, objecttype: &str, row: Row) {
        db.insert_row(&object_table_name(objecttype), &row.with("__version", 1))
            .unwrap();
    }

    fn remote_id(db: &SqliteRepository, objecttype: &str, uid: &str) -> Option<i64> {
        db.query_one(
            &format!(
                "SELECT {} AS id FROM {} WHERE {} = ?1",
                quote_name(EASYDB_ID),
                quote_name(&object_table_name(objecttype)),
                quote_name(SOURCE_UNIQUE_ID)
            ),
            &[Value::from(uid)],
        )
        .unwrap()
        .and_then(|row| row.integer("id"))
    }

    async fn load(destination: &Destination, api: &ObjectApi, options: &LoadOptions, objecttype: &str) -> LoadReport {
        let source = SqliteRepository::open_in_memory().unwrap();
        let assets = AssetResolver::new(&source, destination, api, Client::new());
        let db = destination.db().unwrap();
        let objecttype = destination.objecttype(objecttype).unwrap();
        ObjectLoader::new(destination, api, &assets, objecttype, options)
            .unwrap()
            .load(&db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_parents_load_before_children() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, "ordner", Row::new().with(SOURCE_UNIQUE_ID, "b-root").with("titel", "Archiv"));
        insert(
            &db,
            "ordner",
            Row::new().with(SOURCE_UNIQUE_ID, "a-child").with("titel", "Kiste").with("__parent_id", "b-root"),
        );

        let api = ObjectApi::new(None);
        let report = load(&destination, &api, &LoadOptions::default(), "ordner").await;
        assert_eq!((report.batches, report.pushed, report.failed), (2, 2, 0));

        assert_eq!(api.titles("ordner"), vec![vec!["Archiv"], vec!["Kiste"]]);
        assert_eq!(api.pushed("ordner", "Kiste")["_id_parent"], 100);
        assert!(api.pushed("ordner", "Archiv").get("_id_parent").is_none());
        assert_eq!(remote_id(&db, "ordner", "b-root"), Some(100));
        assert_eq!(remote_id(&db, "ordner", "a-child"), Some(101));
    }

    #[tokio::test]
    async fn test_failed_parent_holds_back_children() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, "ordner", Row::new().with(SOURCE_UNIQUE_ID, "b-broken").with("titel", "kaputt"));
        insert(
            &db,
            "ordner",
            Row::new().with(SOURCE_UNIQUE_ID, "a-child").with("titel", "Kiste").with("__parent_id", "b-broken"),
        );
        insert(&db, "ordner", Row::new().with(SOURCE_UNIQUE_ID, "c-other").with("titel", "Mappe"));

        let api = ObjectApi::new(Some("kaputt"));
        let options = LoadOptions {
            batch_size: 1,
            stop_on_error: false,
            ..LoadOptions::default()
        };
        let report = load(&destination, &api, &options, "ordner").await;
        assert_eq!((report.batches, report.pushed, report.failed), (2, 1, 1));

        assert_eq!(api.titles("ordner"), vec![vec!["kaputt"], vec!["Mappe"]]);
        assert_eq!(remote_id(&db, "ordner", "a-child"), None);
        assert_eq!(remote_id(&db, "ordner", "c-other"), Some(100));
    }

    #[tokio::test]
    async fn test_link_resolves_only_after_target_is_loaded() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, "person", Row::new().with(SOURCE_UNIQUE_ID, "p1").with("titel", "Anna"));
        insert(
            &db,
            "ordner",
            Row::new().with(SOURCE_UNIQUE_ID, "o1").with("titel", "Früh").with("fotograf", "p1"),
        );

        let api = ObjectApi::new(None);
        let options = LoadOptions::default();
        load(&destination, &api, &options, "ordner").await;
        assert_eq!(api.pushed("ordner", "Früh")["fotograf"], JsonValue::Null);

        load(&destination, &api, &options, "person").await;
        insert(
            &db,
            "ordner",
            Row::new().with(SOURCE_UNIQUE_ID, "o2").with("titel", "Spät").with("fotograf", "p1"),
        );
        load(&destination, &api, &options, "ordner").await;
        assert_eq!(api.pushed("ordner", "Spät")["fotograf"], json!({"person": {"_id": 101}}));
    }

    #[test]
    fn test_fold_rows() {
        let rows = vec![
            Row::new().with(SOURCE_UNIQUE_ID, "a").with("n", 1),
            Row::new().with(SOURCE_UNIQUE_ID, "a").with("n", 2),
            Row::new().with(SOURCE_UNIQUE_ID, "b").with("n", 3),
        ];
        let folded = fold_rows(rows);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].integer("n"), Some(1));
    }
}
