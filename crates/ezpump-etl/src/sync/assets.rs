//! Asset resolution for synchronized rows
//!
//! The `file`/`filestore` rows of a source row become rows of the destination
//! asset table `asset.<type>.<column>`. A derivative version must come after
//! its root, so the assets of one row are put in topological order first.

use crate::destination::asset_table_name;
use crate::error::{EtlError, Result};
use crate::repository::Repository;
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::value::{Row, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, error, warn};

/// Where the loader finds an asset's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetSourceType {
    /// Blob in `filestore.data`; the source is the `filestore_id`
    Data,
    /// Local path in `filestore.filename`
    Filename,
    /// Remote location in `filestore.url`
    Url,
}

impl AssetSourceType {
    /// Default preference order
    pub const ALL: [AssetSourceType; 3] = [
        AssetSourceType::Data,
        AssetSourceType::Filename,
        AssetSourceType::Url,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetSourceType::Data => "data",
            AssetSourceType::Filename => "filename",
            AssetSourceType::Url => "url",
        }
    }
}

impl fmt::Display for AssetSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssetSourceType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "data" => Ok(AssetSourceType::Data),
            "filename" | "file" => Ok(AssetSourceType::Filename),
            "url" => Ok(AssetSourceType::Url),
            other => Err(EtlError::config(format!(
                "asset type '{}' does not exist (expected data, filename or url)",
                other
            ))),
        }
    }
}

/// A source column holding assets and the destination column receiving them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetColumn {
    pub source_name: String,
    pub table: String,
    pub column: String,
    pub destination_table: String,
    pub destination_column: String,
    /// Always lists every source type, preferred ones first
    pub preferred_types: Vec<AssetSourceType>,
}

impl AssetColumn {
    pub fn new(
        source_name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        destination_table: impl Into<String>,
        destination_column: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            table: table.into(),
            column: column.into(),
            destination_table: destination_table.into(),
            destination_column: destination_column.into(),
            preferred_types: AssetSourceType::ALL.to_vec(),
        }
    }

    /// Put `types` first; the remaining types keep their default order
    pub fn with_preferred_types(mut self, types: &[AssetSourceType]) -> Self {
        let mut preferred: Vec<AssetSourceType> = Vec::with_capacity(AssetSourceType::ALL.len());
        for t in types.iter().chain(AssetSourceType::ALL.iter()) {
            if !preferred.contains(t) {
                preferred.push(*t);
            }
        }
        self.preferred_types = preferred;
        self
    }

    /// Destination table of the asset rows
    pub fn asset_table(&self) -> String {
        asset_table_name(&self.destination_table, &self.destination_column)
    }
}

impl fmt::Display for AssetColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} -> {}.{}",
            self.source_name, self.table, self.column, self.destination_table, self.destination_column
        )
    }
}

/// One stored file of a source row, ready to become an asset row
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAsset {
    /// Remote asset id if known, the `file_id` otherwise
    pub key: i64,
    /// Key of the asset this one is derived from
    pub root: Option<i64>,
    pub file_id: i64,
    pub eas_id: Option<i64>,
    pub original_filename: Option<String>,
    pub source_type: AssetSourceType,
    pub source: String,
}

const ASSET_INFO_SQL: &str = r#"
    SELECT
        f.file_id AS file_id,
        f.filestore_id AS filestore_id,
        f.eas_id AS eas_id,
        f.eas_root_id AS eas_root_id,
        fs.original_filename AS original_filename,
        fs.url IS NOT NULL AS has_url,
        fs.filename IS NOT NULL AS has_filename,
        fs.data IS NOT NULL AS has_data,
        fs.url AS url,
        fs.filename AS filename
    FROM file f
    JOIN filestore fs ON f.filestore_id = fs.filestore_id
    WHERE f.source_name = ?1
      AND f.source_table_name = ?2
      AND f.source_column_name = ?3
      AND f.source_unique_id = ?4
    ORDER BY f.file_id
"#;

/// Files stored for one source row and column, in discovery order
pub fn load_file_assets(
    source: &dyn Repository,
    column: &AssetColumn,
    file_table_id: &str,
) -> Result<Vec<ResolvedAsset>> {
    let rows = source.query(
        ASSET_INFO_SQL,
        &[
            Value::from(column.source_name.as_str()),
            Value::from(column.table.as_str()),
            Value::from(column.column.as_str()),
            Value::from(file_table_id),
        ],
    )?;

    let mut assets: Vec<ResolvedAsset> = Vec::with_capacity(rows.len());
    for row in rows {
        let file_id = row.integer("file_id").unwrap_or_default();
        let available = |t: AssetSourceType| {
            row.value(&format!("has_{}", t.as_str()))
                .as_bool()
                .unwrap_or(false)
        };
        let Some(source_type) = column.preferred_types.iter().copied().find(|t| available(*t))
        else {
            error!(column = %column, file_id, source_id = %file_table_id, "filestore: no valid source");
            continue;
        };
        let source_value = match source_type {
            AssetSourceType::Data => row.text("filestore_id"),
            AssetSourceType::Filename => row.text("filename"),
            AssetSourceType::Url => row.text("url"),
        }
        .unwrap_or_default();

        let eas_id = row.integer("eas_id");
        let key = eas_id.unwrap_or(file_id);
        if assets.iter().any(|a| a.key == key) {
            debug!(column = %column, key, "asset listed twice, keeping first");
            continue;
        }
        assets.push(ResolvedAsset {
            key,
            root: row.integer("eas_root_id"),
            file_id,
            eas_id,
            original_filename: row.text("original_filename"),
            source_type,
            source: source_value,
        });
    }
    Ok(assets)
}

/// Order assets so that every asset follows its root
///
/// Repeatedly takes the first asset, in discovery order, whose root is
/// already placed (or absent from the set). Assets caught in a cycle are
/// appended in discovery order.
pub fn order_assets(assets: Vec<ResolvedAsset>) -> Vec<ResolvedAsset> {
    let keys: HashSet<i64> = assets.iter().map(|a| a.key).collect();
    let mut placed: HashSet<i64> = HashSet::with_capacity(assets.len());
    let mut ordered = Vec::with_capacity(assets.len());
    let mut remaining: Vec<Option<ResolvedAsset>> = assets.into_iter().map(Some).collect();

    loop {
        let ready = remaining.iter().position(|slot| match slot {
            Some(asset) => match asset.root {
                None => true,
                Some(root) => root == asset.key || !keys.contains(&root) || placed.contains(&root),
            },
            None => false,
        });
        let Some(index) = ready else { break };
        if let Some(asset) = remaining[index].take() {
            placed.insert(asset.key);
            ordered.push(asset);
        }
    }

    let cyclic: Vec<ResolvedAsset> = remaining.into_iter().flatten().collect();
    if !cyclic.is_empty() {
        warn!(count = cyclic.len(), "asset roots form a cycle, appending in discovery order");
        ordered.extend(cyclic);
    }
    ordered
}

/// Destination asset rows for an object; the first asset is preferred
pub fn asset_rows(object_id: &str, ordered: &[ResolvedAsset]) -> Vec<Row> {
    ordered
        .iter()
        .enumerate()
        .map(|(i, asset)| {
            Row::new()
                .with(
                    SOURCE_UNIQUE_ID,
                    format!("{}:{}:{}", object_id, asset.source_type, asset.source),
                )
                .with(super::VERSION, super::DEFAULT_VERSION)
                .with("__eas_id", asset.eas_id)
                .with("object_id", object_id)
                .with("preferred", i == 0)
                .with("original_filename", asset.original_filename.clone())
                .with("source_type", asset.source_type.as_str())
                .with("source", asset.source.as_str())
        })
        .collect()
}

/// Insert the asset rows of one object, skipping rows that already exist
pub fn attach_assets(
    source: &dyn Repository,
    destination: &dyn Repository,
    column: &AssetColumn,
    file_table_id: &str,
    object_id: &str,
) -> Result<usize> {
    let table = column.asset_table();
    let assets = order_assets(load_file_assets(source, column, file_table_id)?);
    let exists_sql = format!(
        "SELECT 1 FROM {} WHERE {} = ?1",
        crate::repository::quote_name(&table),
        crate::repository::quote_name(SOURCE_UNIQUE_ID)
    );

    let mut inserted = 0;
    for row in asset_rows(object_id, &assets) {
        let uid = row.value(SOURCE_UNIQUE_ID);
        if destination.query_one(&exists_sql, &[uid])?.is_some() {
            continue;
        }
        destination.insert_row(&table, &row)?;
        inserted += 1;
    }
    debug!(column = %column, object_id, inserted, "assets attached");
    Ok(inserted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn asset(key: i64, root: Option<i64>) -> ResolvedAsset {
        ResolvedAsset {
            key,
            root,
            file_id: key,
            eas_id: None,
            original_filename: None,
            source_type: AssetSourceType::Data,
            source: key.to_string(),
        }
    }

    fn keys(assets: &[ResolvedAsset]) -> Vec<i64> {
        assets.iter().map(|a| a.key).collect()
    }

    #[test]
    fn test_root_before_derivative() {
        // A = 1, B = 2 (root A), C = 3 (root B), given as C, A, B
        let ordered = order_assets(vec![asset(3, Some(2)), asset(1, None), asset(2, Some(1))]);
        assert_eq!(keys(&ordered), vec![1, 2, 3]);

        let ordered = order_assets(vec![asset(2, Some(1)), asset(3, Some(2)), asset(1, None)]);
        assert_eq!(keys(&ordered), vec![1, 2, 3]);
    }

    #[test]
    fn test_siblings_keep_discovery_order() {
        let ordered = order_assets(vec![asset(5, Some(1)), asset(1, None), asset(4, Some(1))]);
        assert_eq!(keys(&ordered), vec![1, 5, 4]);
    }

    #[test]
    fn test_unknown_root_and_cycle() {
        let ordered = order_assets(vec![asset(7, Some(99)), asset(8, Some(9)), asset(9, Some(8))]);
        assert_eq!(keys(&ordered), vec![7, 8, 9]);
    }

    #[test]
    fn test_preferred_types_are_completed() {
        let column = AssetColumn::new("s", "t", "c", "bilder", "datei")
            .with_preferred_types(&[AssetSourceType::Url]);
        assert_eq!(
            column.preferred_types,
            vec![
                AssetSourceType::Url,
                AssetSourceType::Data,
                AssetSourceType::Filename
            ]
        );
        assert_eq!(column.asset_table(), "asset.bilder.datei");
        assert!("thumbnail".parse::<AssetSourceType>().is_err());
    }

    #[test]
    fn test_asset_rows_first_is_preferred() {
        let rows = asset_rows("obj-1", &[asset(1, None), asset(2, Some(1))]);
        assert_eq!(rows[0].text(SOURCE_UNIQUE_ID).as_deref(), Some("obj-1:data:1"));
        assert_eq!(rows[0].value("preferred").as_bool(), Some(true));
        assert_eq!(rows[1].value("preferred").as_bool(), Some(false));
    }
}
