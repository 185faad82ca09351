//! Loaders for pools, groups, users, tags and collections
//!
//! These records have their own API calls and payload shapes. Pools and
//! collections are trees and load top-down: a record is selected only once
//! its parent has a remote id.

use super::{LoadOptions, LoadReport};
use crate::api::payload::{
    collection_objects_payload, collection_payload, group_payload, pool_payload,
    tag_group_payload, user_payload,
};
use crate::api::RemoteApi;
use crate::destination::schema::{
    COLLECTION_OBJECTS_TYPE, COLLECTION_TYPE, GROUP_TYPE, POOL_TYPE, TAG_GROUP_TYPE, TAG_TYPE,
    USER_GROUP_TYPE, USER_TYPE,
};
use crate::destination::{object_table_name, Destination, EASYDB_ID};
use crate::error::{EtlError, Result};
use crate::repository::{quote_name, Repository};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::value::{Row, Value};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// Ids that failed in an earlier round and must not be selected again
#[derive(Default)]
struct Failures {
    ids: HashSet<String>,
}

impl Failures {
    fn select(&self, db: &dyn Repository, sql: &str, batch_size: usize) -> Result<Vec<Row>> {
        let limit = (batch_size + self.ids.len()) as i64;
        Ok(db
            .query(&format!("{} LIMIT ?1", sql), &[Value::from(limit)])?
            .into_iter()
            .filter(|row| {
                row.text(SOURCE_UNIQUE_ID)
                    .map_or(true, |id| !self.ids.contains(&id))
            })
            .take(batch_size)
            .collect())
    }

    /// Propagate `err` or record the batch as failed
    fn record(&mut self, err: EtlError, what: &str, rows: &[Row], options: &LoadOptions, report: &mut LoadReport) -> Result<()> {
        error!(what, rows = rows.len(), error = %err, "load failed");
        if options.stop_on_error || err.is_fatal() {
            return Err(err);
        }
        report.failed += rows.len();
        self.ids
            .extend(rows.iter().filter_map(|row| row.text(SOURCE_UNIQUE_ID)));
        Ok(())
    }
}

/// `alias."col" AS "col"` for every column of an object table except `exclude`
fn select_list(destination: &Destination, objecttype: &str, alias: &str, exclude: &[&str]) -> Result<String> {
    let table = destination.table_for_objecttype(objecttype)?;
    Ok(table
        .columns
        .iter()
        .filter(|c| !exclude.contains(&c.name.as_str()))
        .map(|c| format!("{}.{} AS {}", alias, quote_name(&c.name), quote_name(&c.name)))
        .collect::<Vec<_>>()
        .join(", "))
}

fn store_ids(db: &dyn Repository, objecttype: &str, rows: &[Row], ids: &[i64]) -> Result<()> {
    if rows.len() != ids.len() {
        return Err(EtlError::protocol(format!(
            "{}: {} ids returned for {} pushed",
            objecttype,
            ids.len(),
            rows.len()
        )));
    }
    let sql = format!(
        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
        quote_name(&object_table_name(objecttype)),
        quote_name(EASYDB_ID),
        quote_name(SOURCE_UNIQUE_ID)
    );
    for (row, id) in rows.iter().zip(ids) {
        let uid = row.value(SOURCE_UNIQUE_ID);
        let updated = db.execute(&sql, &[Value::from(*id), uid.clone()])?;
        if updated != 1 {
            return Err(EtlError::protocol(format!(
                "{}: remote id {} not stored for '{}' ({} rows updated)",
                objecttype, id, uid, updated
            )));
        }
    }
    Ok(())
}

pub struct SpecialLoader<'a> {
    db: &'a dyn Repository,
    api: &'a dyn RemoteApi,
    destination: &'a Destination,
    options: &'a LoadOptions,
}

impl<'a> SpecialLoader<'a> {
    pub fn new(
        db: &'a dyn Repository,
        api: &'a dyn RemoteApi,
        destination: &'a Destination,
        options: &'a LoadOptions,
    ) -> Self {
        Self {
            db,
            api,
            destination,
            options,
        }
    }

    fn languages(&self) -> &[String] {
        self.destination.languages()
    }

    /// Top-down pool tree; pools without parent go below the root pool
    pub async fn pools(&self) -> Result<LoadReport> {
        info!("load pools");
        let table = quote_name(&object_table_name(POOL_TYPE));
        let sql = format!(
            "SELECT {columns}, p.{id} AS \"__parent_id\" FROM {table} c \
             LEFT JOIN {table} p ON c.\"__parent_id\" = p.{uid} \
             WHERE c.{id} IS NULL AND (c.\"__parent_id\" IS NULL OR p.{id} IS NOT NULL) \
             ORDER BY c.{uid}",
            columns = select_list(self.destination, POOL_TYPE, "c", &["__parent_id"])?,
            id = quote_name(EASYDB_ID),
            uid = quote_name(SOURCE_UNIQUE_ID),
        );

        let mut report = LoadReport::default();
        let mut failures = Failures::default();
        loop {
            let rows = failures.select(self.db, &sql, self.options.batch_size)?;
            if rows.is_empty() {
                break;
            }
            report.batches += 1;
            match self.push_pools(&rows).await {
                Ok(()) => report.pushed += rows.len(),
                Err(e) => failures.record(e, "pools", &rows, self.options, &mut report)?,
            }
        }
        Ok(report)
    }

    async fn push_pools(&self, rows: &[Row]) -> Result<()> {
        let root = if rows.iter().any(|row| row.integer("__parent_id").is_none()) {
            self.api.root_pool_id().await?
        } else {
            0
        };
        let payloads = rows
            .iter()
            .map(|row| pool_payload(row, self.languages(), root))
            .collect::<Result<Vec<_>>>()?;
        let ids = self.api.create_pools(&payloads).await?;
        store_ids(self.db, POOL_TYPE, rows, &ids)
    }

    pub async fn groups(&self) -> Result<LoadReport> {
        info!("load groups");
        let sql = format!(
            "SELECT * FROM {} WHERE {} IS NULL ORDER BY {}",
            quote_name(&object_table_name(GROUP_TYPE)),
            quote_name(EASYDB_ID),
            quote_name(SOURCE_UNIQUE_ID)
        );
        let mut report = LoadReport::default();
        let mut failures = Failures::default();
        loop {
            let rows = failures.select(self.db, &sql, self.options.batch_size)?;
            if rows.is_empty() {
                break;
            }
            report.batches += 1;
            let payloads: Vec<JsonValue> = rows
                .iter()
                .map(|row| group_payload(row, self.languages()))
                .collect();
            let pushed = match self.api.create_groups(&payloads).await {
                Ok(ids) => store_ids(self.db, GROUP_TYPE, &rows, &ids),
                Err(e) => Err(e),
            };
            match pushed {
                Ok(()) => report.pushed += rows.len(),
                Err(e) => failures.record(e, "groups", &rows, self.options, &mut report)?,
            }
        }
        Ok(report)
    }

    /// Users with their group memberships; groups must be loaded first
    pub async fn users(&self) -> Result<LoadReport> {
        info!("load users");
        let sql = format!(
            "SELECT * FROM {} WHERE {} IS NULL ORDER BY {}",
            quote_name(&object_table_name(USER_TYPE)),
            quote_name(EASYDB_ID),
            quote_name(SOURCE_UNIQUE_ID)
        );
        let groups_sql = format!(
            "SELECT g.{id} AS id FROM {user_group} ug JOIN {group} g ON ug.group_id = g.{uid} \
             WHERE ug.user_id = ?1 AND g.{id} IS NOT NULL",
            id = quote_name(EASYDB_ID),
            uid = quote_name(SOURCE_UNIQUE_ID),
            user_group = quote_name(&object_table_name(USER_GROUP_TYPE)),
            group = quote_name(&object_table_name(GROUP_TYPE)),
        );

        let mut report = LoadReport::default();
        let mut failures = Failures::default();
        loop {
            let rows = failures.select(self.db, &sql, self.options.batch_size)?;
            if rows.is_empty() {
                break;
            }
            report.batches += 1;
            let mut payloads = Vec::with_capacity(rows.len());
            for row in &rows {
                let group_ids: Vec<i64> = self
                    .db
                    .query(&groups_sql, &[row.value(SOURCE_UNIQUE_ID)])?
                    .iter()
                    .filter_map(|g| g.integer("id"))
                    .collect();
                payloads.push(user_payload(row, &group_ids));
            }
            let pushed = match payloads.into_iter().collect::<Result<Vec<_>>>() {
                Ok(payloads) => match self.api.create_users(&payloads).await {
                    Ok(ids) => store_ids(self.db, USER_TYPE, &rows, &ids),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match pushed {
                Ok(()) => report.pushed += rows.len(),
                Err(e) => failures.record(e, "users", &rows, self.options, &mut report)?,
            }
        }
        Ok(report)
    }

    /// Tag groups with their tags, pushed as nested payloads
    pub async fn tags(&self) -> Result<LoadReport> {
        info!("load tags");
        let groups_sql = format!(
            "SELECT * FROM {} WHERE {} IS NULL ORDER BY {}",
            quote_name(&object_table_name(TAG_GROUP_TYPE)),
            quote_name(EASYDB_ID),
            quote_name(SOURCE_UNIQUE_ID)
        );
        let tags_sql = format!(
            "SELECT * FROM {} WHERE \"group\" = ?1 AND {} IS NULL ORDER BY {}",
            quote_name(&object_table_name(TAG_TYPE)),
            quote_name(EASYDB_ID),
            quote_name(SOURCE_UNIQUE_ID)
        );

        let mut report = LoadReport::default();
        let mut failures = Failures::default();
        loop {
            let groups = failures.select(self.db, &groups_sql, self.options.batch_size)?;
            if groups.is_empty() {
                break;
            }
            report.batches += 1;
            let mut payloads = Vec::with_capacity(groups.len());
            let mut tags = Vec::with_capacity(groups.len());
            for group in &groups {
                let group_tags = self.db.query(&tags_sql, &[group.value(SOURCE_UNIQUE_ID)])?;
                payloads.push(tag_group_payload(group, &group_tags, self.languages()));
                tags.push(group_tags);
            }

            match self.push_tags(&groups, &tags, &payloads).await {
                Ok(pushed) => report.pushed += pushed,
                Err(e) => failures.record(e, "tags", &groups, self.options, &mut report)?,
            }
        }
        Ok(report)
    }

    async fn push_tags(&self, groups: &[Row], tags: &[Vec<Row>], payloads: &[JsonValue]) -> Result<usize> {
        let created = self.api.create_tag_groups(payloads).await?;
        let ids: Vec<i64> = created.iter().map(|g| g.id).collect();
        store_ids(self.db, TAG_GROUP_TYPE, groups, &ids)?;

        let mut pushed = groups.len();
        for (group_tags, created_group) in tags.iter().zip(&created) {
            store_ids(self.db, TAG_TYPE, group_tags, &created_group.tag_ids)?;
            pushed += group_tags.len();
        }
        Ok(pushed)
    }

    /// Resolve owners and user root collections, then load the collection tree
    pub async fn collections(&self) -> Result<LoadReport> {
        info!("load collections");
        let table = quote_name(&object_table_name(COLLECTION_TYPE));
        let pending = self
            .db
            .query_one(
                &format!("SELECT COUNT(*) AS n FROM {} WHERE {} IS NULL", table, quote_name(EASYDB_ID)),
                &[],
            )?
            .and_then(|row| row.integer("n"))
            .unwrap_or(0);
        if pending == 0 {
            debug!("no collections to load");
            return Ok(LoadReport::default());
        }
        self.resolve_collection_owners()?;
        self.resolve_user_collections().await?;

        let sql = format!(
            "SELECT {columns}, p.{id} AS \"__parent_id\" FROM {table} c \
             LEFT JOIN {table} p ON c.\"__parent_id\" = p.{uid} \
             WHERE c.{id} IS NULL AND (c.\"__parent_id\" IS NULL OR p.{id} IS NOT NULL) \
             ORDER BY c.{uid}",
            columns = select_list(self.destination, COLLECTION_TYPE, "c", &["__parent_id"])?,
            id = quote_name(EASYDB_ID),
            uid = quote_name(SOURCE_UNIQUE_ID),
        );

        let mut report = LoadReport::default();
        let mut failures = Failures::default();
        loop {
            let rows = failures.select(self.db, &sql, self.options.batch_size)?;
            if rows.is_empty() {
                break;
            }
            report.batches += 1;
            for row in rows {
                let payload = collection_payload(&row, self.languages());
                debug!(collection = %row.value(SOURCE_UNIQUE_ID), "PUT collection");
                let pushed = match self.api.create_collection(&payload).await {
                    Ok(id) => store_ids(self.db, COLLECTION_TYPE, std::slice::from_ref(&row), &[id]),
                    Err(e) => Err(e),
                };
                match pushed {
                    Ok(()) => report.pushed += 1,
                    Err(e) => failures.record(
                        e,
                        "collection",
                        std::slice::from_ref(&row),
                        self.options,
                        &mut report,
                    )?,
                }
            }
        }
        Ok(report)
    }

    /// `__owner = 'user_<login>'` becomes the pushed user's remote id
    fn resolve_collection_owners(&self) -> Result<()> {
        let users = self.db.query(
            &format!(
                "SELECT login, {id} AS id FROM {} WHERE {id} IS NOT NULL AND login IS NOT NULL",
                quote_name(&object_table_name(USER_TYPE)),
                id = quote_name(EASYDB_ID)
            ),
            &[],
        )?;
        let sql = format!(
            "UPDATE {} SET \"__owner_id\" = ?1, \"__owner\" = ?2 WHERE \"__owner\" = ?3",
            quote_name(&object_table_name(COLLECTION_TYPE))
        );
        for user in users {
            let login = user.text("login").unwrap_or_default();
            self.db.execute(
                &sql,
                &[
                    user.value("id"),
                    Value::from(login.as_str()),
                    Value::from(format!("user_{}", login)),
                ],
            )?;
        }
        Ok(())
    }

    async fn resolve_user_collections(&self) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET \"__user_collection_id\" = ?1 WHERE \"__owner_id\" = ?2 AND \"__parent_id\" IS NULL",
            quote_name(&object_table_name(COLLECTION_TYPE))
        );
        for collection in self.api.user_collections().await? {
            let updated = self.db.execute(
                &sql,
                &[
                    Value::from(collection.collection_id),
                    Value::from(collection.owner_id),
                ],
            )?;
            debug!(owner = collection.owner_id, collection = collection.collection_id, updated, "user collection");
        }
        Ok(())
    }

    /// Post memberships of pushed objects into pushed collections
    pub async fn collection_objects(&self) -> Result<LoadReport> {
        info!("load collection objects");
        let memberships = quote_name(&object_table_name(COLLECTION_OBJECTS_TYPE));
        for ot in &self.destination.schema().objecttypes {
            let table = self.destination.table_for_objecttype(&ot.name)?;
            if !table.has_column("collection_id") {
                continue;
            }
            let objects = quote_name(&table.name);
            let copied = self.db.execute(
                &format!(
                    "UPDATE {memberships} SET object_goid = \
                     (SELECT o.\"__easydb_goid\" FROM {objects} o WHERE o.{uid} = {memberships}.object_id) \
                     WHERE object_goid IS NULL AND object_id IN \
                     (SELECT {uid} FROM {objects} WHERE \"__easydb_goid\" IS NOT NULL)",
                    uid = quote_name(SOURCE_UNIQUE_ID),
                ),
                &[],
            )?;
            debug!(objecttype = %ot.name, copied, "collection object ids");
        }

        let rows = self.db.query(
            &format!(
                "SELECT co.{uid} AS {uid}, co.object_goid AS object_goid, c.{id} AS collection \
                 FROM {memberships} co JOIN {collections} c ON co.collection_id = c.{uid} \
                 WHERE co.uploaded IS NULL AND c.{id} IS NOT NULL ORDER BY co.position, co.{uid}",
                uid = quote_name(SOURCE_UNIQUE_ID),
                id = quote_name(EASYDB_ID),
                collections = quote_name(&object_table_name(COLLECTION_TYPE)),
            ),
            &[],
        )?;

        let mark_sql = format!(
            "UPDATE {memberships} SET uploaded = 'yes' WHERE {} = ?1",
            quote_name(SOURCE_UNIQUE_ID)
        );
        let mut report = LoadReport {
            batches: usize::from(!rows.is_empty()),
            ..LoadReport::default()
        };
        for row in rows {
            let (Some(goid), Some(collection)) = (row.text("object_goid"), row.integer("collection")) else {
                report.skipped += 1;
                continue;
            };
            let posted = self
                .api
                .add_collection_objects(collection, &collection_objects_payload(&goid))
                .await
                .and_then(|()| self.db.execute(&mark_sql, &[row.value(SOURCE_UNIQUE_ID)]));
            match posted {
                Ok(_) => report.pushed += 1,
                Err(e) => {
                    error!(collection, goid = %goid, error = %e, "collection object failed");
                    if self.options.stop_on_error || e.is_fatal() {
                        return Err(e);
                    }
                    report.failed += 1;
                },
            }
        }
        if report.skipped > 0 {
            warn!(skipped = report.skipped, "collection objects without global object id");
        }
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::{CreatedObject, CreatedTagGroup, UserCollection};
    use crate::destination::{CreatePolicy, L10N_FILE, SCHEMA_FILE};
    use crate::repository::SqliteRepository;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Hands out increasing ids and records every payload
    struct RecordingApi {
        next_id: AtomicI64,
        calls: Mutex<Vec<(String, JsonValue)>>,
        reject_groups: bool,
    }

    impl RecordingApi {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(100),
                calls: Mutex::new(Vec::new()),
                reject_groups: false,
            }
        }

        fn ids(&self, call: &str, entries: &[JsonValue]) -> Vec<i64> {
            let mut calls = self.calls.lock().unwrap();
            entries.iter().map(|e| {
                calls.push((call.to_string(), e.clone()));
                self.next_id.fetch_add(1, Ordering::SeqCst)
            }).collect()
        }

        fn calls(&self, call: &str) -> Vec<JsonValue> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == call)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteApi for RecordingApi {
        async fn schema(&self) -> Result<JsonValue> {
            Ok(json!({}))
        }
        async fn config(&self) -> Result<JsonValue> {
            Ok(json!({}))
        }
        async fn create_objects(&self, _: &str, objects: &[JsonValue]) -> Result<Vec<CreatedObject>> {
            Ok(self
                .ids("objects", objects)
                .into_iter()
                .map(|id| CreatedObject {
                    id,
                    global_object_id: Some(format!("{}@test", id)),
                })
                .collect())
        }
        async fn create_pools(&self, pools: &[JsonValue]) -> Result<Vec<i64>> {
            Ok(self.ids("pools", pools))
        }
        async fn create_groups(&self, groups: &[JsonValue]) -> Result<Vec<i64>> {
            if self.reject_groups {
                return Err(EtlError::api("group rejected"));
            }
            Ok(self.ids("groups", groups))
        }
        async fn create_users(&self, users: &[JsonValue]) -> Result<Vec<i64>> {
            Ok(self.ids("users", users))
        }
        async fn create_tag_groups(&self, tag_groups: &[JsonValue]) -> Result<Vec<CreatedTagGroup>> {
            let ids = self.ids("tag_groups", tag_groups);
            Ok(tag_groups
                .iter()
                .zip(ids)
                .map(|(group, id)| CreatedTagGroup {
                    id,
                    tag_ids: group["_tags"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|_| self.next_id.fetch_add(1, Ordering::SeqCst))
                        .collect(),
                })
                .collect())
        }
        async fn create_collection(&self, collection: &JsonValue) -> Result<i64> {
            Ok(self.ids("collections", std::slice::from_ref(collection))[0])
        }
        async fn add_collection_objects(&self, collection_id: i64, objects: &JsonValue) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("collection_objects/{}", collection_id), objects.clone()));
            Ok(())
        }
        async fn root_pool_id(&self) -> Result<i64> {
            Ok(1)
        }
        async fn user_collections(&self) -> Result<Vec<UserCollection>> {
            Ok(vec![UserCollection {
                owner_id: 42,
                collection_id: 900,
            }])
        }
        async fn upload_asset(&self, _: &str, _: Vec<u8>) -> Result<i64> {
            Err(EtlError::asset("no uploads in this test"))
        }
    }

    fn destination(dir: &TempDir) -> Destination {
        let schema = json!({
            "type": "user",
            "version": 1,
            "tables": [{"name": "bilder", "columns": [{"kind": "column", "name": "titel", "type": "text"}]}]
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

    #[tokio::test]
    async fn test_pool_tree_loads_top_down() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, POOL_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "a-child").with("__parent_id", "b-root"));
        insert(&db, POOL_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "b-root").with("name:de-DE", "Archiv"));

        let api = RecordingApi::new();
        let options = LoadOptions::default();
        let report = SpecialLoader::new(&db, &api, &destination, &options).pools().await.unwrap();
        assert_eq!((report.batches, report.pushed), (2, 2));

        let pools = api.calls("pools");
        assert_eq!(pools[0]["pool"]["_id_parent"], 1);
        assert_eq!(pools[0]["pool"]["name"], json!({"de-DE": "Archiv"}));
        assert_eq!(pools[1]["pool"]["_id_parent"], 100);
        assert_eq!(remote_id(&db, POOL_TYPE, "a-child"), Some(101));
    }

    #[tokio::test]
    async fn test_users_carry_loaded_groups() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, GROUP_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "g1").with("displayname:de-DE", "Redaktion"));
        insert(&db, USER_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "u1").with("login", "anna").with("email", "anna@example.org"));
        insert(&db, USER_GROUP_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "u1-g1").with("user_id", "u1").with("group_id", "g1"));

        let api = RecordingApi::new();
        let options = LoadOptions::default();
        let loader = SpecialLoader::new(&db, &api, &destination, &options);
        loader.groups().await.unwrap();
        loader.users().await.unwrap();

        let users = api.calls("users");
        assert_eq!(users[0]["_groups"], json!([{"group": {"_id": 100}}]));
        assert_eq!(users[0]["_emails"][0]["email"], "anna@example.org");
        assert_eq!(remote_id(&db, USER_TYPE, "u1"), Some(101));
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, GROUP_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "g1"));

        let mut api = RecordingApi::new();
        api.reject_groups = true;
        let options = LoadOptions {
            stop_on_error: false,
            ..LoadOptions::default()
        };
        let report = SpecialLoader::new(&db, &api, &destination, &options).groups().await.unwrap();
        assert_eq!((report.batches, report.pushed, report.failed), (1, 0, 1));

        let strict = LoadOptions::default();
        assert!(SpecialLoader::new(&db, &api, &destination, &strict).groups().await.is_err());
    }

    #[test]
    fn test_lost_write_back_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, GROUP_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "g1"));

        let gone = [Row::new().with(SOURCE_UNIQUE_ID, "g2")];
        let err = store_ids(&db, GROUP_TYPE, &gone, &[5]).unwrap_err();
        assert!(matches!(err, EtlError::Protocol(_)));
        assert!(err.is_fatal());

        let kept = [Row::new().with(SOURCE_UNIQUE_ID, "g1")];
        store_ids(&db, GROUP_TYPE, &kept, &[5]).unwrap();
        assert_eq!(remote_id(&db, GROUP_TYPE, "g1"), Some(5));
    }

    #[tokio::test]
    async fn test_tags_get_ids_per_group() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, TAG_GROUP_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "status").with("type", "checkbox"));
        insert(&db, TAG_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "status-a").with("group", "status").with("type", "individual"));
        insert(&db, TAG_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "status-b").with("group", "status").with("type", "individual"));

        let api = RecordingApi::new();
        let options = LoadOptions::default();
        let report = SpecialLoader::new(&db, &api, &destination, &options).tags().await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(api.calls("tag_groups")[0]["_tags"].as_array().unwrap().len(), 2);
        assert_eq!(remote_id(&db, TAG_GROUP_TYPE, "status"), Some(100));
        assert_eq!(remote_id(&db, TAG_TYPE, "status-b"), Some(102));
    }

    #[tokio::test]
    async fn test_collections_and_memberships() {
        let dir = TempDir::new().unwrap();
        let destination = destination(&dir);
        let db = destination.db().unwrap();
        insert(&db, USER_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "u1").with("login", "anna").with(EASYDB_ID, 42));
        insert(&db, COLLECTION_TYPE, Row::new().with(SOURCE_UNIQUE_ID, "c1").with("__owner", "user_anna"));
        insert(&db, "bilder", Row::new().with(SOURCE_UNIQUE_ID, "b1").with(crate::destination::EASYDB_GOID, "7@test"));
        insert(&db, "bilder", Row::new().with(SOURCE_UNIQUE_ID, "b2"));
        insert(
            &db,
            COLLECTION_OBJECTS_TYPE,
            Row::new().with(SOURCE_UNIQUE_ID, "m1").with("collection_id", "c1").with("object_id", "b1").with("position", 1),
        );
        insert(
            &db,
            COLLECTION_OBJECTS_TYPE,
            Row::new().with(SOURCE_UNIQUE_ID, "m2").with("collection_id", "c1").with("object_id", "b2").with("position", 2),
        );

        let api = RecordingApi::new();
        let options = LoadOptions::default();
        let loader = SpecialLoader::new(&db, &api, &destination, &options);
        loader.collections().await.unwrap();

        let collection = &api.calls("collections")[0];
        assert_eq!(collection["collection"]["_id_parent"], 900);
        assert_eq!(collection["_owner"]["user"]["_id"], 42);

        let report = loader.collection_objects().await.unwrap();
        assert_eq!((report.pushed, report.skipped), (1, 1));
        assert_eq!(
            api.calls("collection_objects/100"),
            vec![json!({"objects": [{"_global_object_id": "7@test"}]})]
        );

        let again = loader.collection_objects().await.unwrap();
        assert_eq!((again.pushed, again.skipped), (0, 1));
    }
}
