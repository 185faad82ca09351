//! Provenance registry of imported foreign tables

use crate::error::{EtlError, Result};
use crate::intermediate::{shadow_table_name, ORIGIN_TABLE};
use crate::repository::{quote_name, Repository};
use crate::value::{Row, Value};
use tracing::info;

/// One row of the `origin` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub origin_type: String,
    pub origin_database_name: String,
    pub origin_table_name: String,
    pub source_name: String,
    pub source_table_name: String,
}

impl Origin {
    /// Name of the shadow table holding this origin's rows
    pub fn shadow_table(&self) -> String {
        shadow_table_name(&self.source_name, &self.source_table_name)
    }

    fn from_row(row: &Row) -> Self {
        Self {
            origin_type: row.text("origin_type").unwrap_or_default(),
            origin_database_name: row.text("origin_database_name").unwrap_or_default(),
            origin_table_name: row.text("origin_table_name").unwrap_or_default(),
            source_name: row.text("source_name").unwrap_or_default(),
            source_table_name: row.text("source_table_name").unwrap_or_default(),
        }
    }
}

/// Maps `(origin_type, database, table)` to `(source_name, source_table_name)`
pub struct OriginRegistry<'a> {
    repo: &'a dyn Repository,
}

impl<'a> OriginRegistry<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    pub fn find(
        &self,
        origin_type: &str,
        database_name: &str,
        table_name: &str,
    ) -> Result<Option<Origin>> {
        let row = self.repo.query_one(
            "SELECT * FROM origin WHERE origin_type = ?1 AND origin_database_name = ?2 AND origin_table_name = ?3",
            &[
                Value::from(origin_type),
                Value::from(database_name),
                Value::from(table_name),
            ],
        )?;
        Ok(row.as_ref().map(Origin::from_row))
    }

    /// Origin for a foreign table; registered on first sight, renamed on collision
    ///
    /// A table name already taken inside `source_name` by another origin gets
    /// the first free suffix `_1`, `_2`, ...
    pub fn register(
        &self,
        origin_type: &str,
        database_name: &str,
        table_name: &str,
        source_name: &str,
    ) -> Result<Origin> {
        if let Some(existing) = self.find(origin_type, database_name, table_name)? {
            return Ok(existing);
        }

        let mut candidate = table_name.to_string();
        let mut suffix = 0;
        while self.is_taken(source_name, &candidate)? {
            suffix += 1;
            candidate = format!("{}_{}", table_name, suffix);
        }
        if suffix > 0 {
            info!(
                source = %source_name,
                table = %table_name,
                renamed = %candidate,
                "table name already taken, renamed"
            );
        }

        let origin = Origin {
            origin_type: origin_type.to_string(),
            origin_database_name: database_name.to_string(),
            origin_table_name: table_name.to_string(),
            source_name: source_name.to_string(),
            source_table_name: candidate,
        };
        self.repo.insert_row(
            ORIGIN_TABLE,
            &Row::new()
                .with("origin_type", origin.origin_type.as_str())
                .with("origin_database_name", origin.origin_database_name.as_str())
                .with("origin_table_name", origin.origin_table_name.as_str())
                .with("source_name", origin.source_name.as_str())
                .with("source_table_name", origin.source_table_name.as_str()),
        )?;
        Ok(origin)
    }

    fn is_taken(&self, source_name: &str, source_table_name: &str) -> Result<bool> {
        Ok(self
            .repo
            .query_one(
                "SELECT origin_id FROM origin WHERE source_name = ?1 AND source_table_name = ?2",
                &[Value::from(source_name), Value::from(source_table_name)],
            )?
            .is_some())
    }

    pub fn all(&self) -> Result<Vec<Origin>> {
        Ok(self
            .repo
            .query("SELECT * FROM origin ORDER BY origin_id", &[])?
            .iter()
            .map(Origin::from_row)
            .collect())
    }

    pub fn for_source(&self, source_name: &str) -> Result<Vec<Origin>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|o| o.source_name == source_name)
            .collect())
    }
}

const PLACEHOLDER_OPEN: &str = "[[table:";
const PLACEHOLDER_CLOSE: &str = "]]";

/// Replace `[[table:<database>.<table>]]` by the quoted shadow table name
///
/// The database part may itself contain dots (file names), so the reference is
/// split at the last dot. Every unknown reference is reported at once.
pub fn resolve_placeholders(repo: &dyn Repository, sql: &str) -> Result<String> {
    if !sql.contains(PLACEHOLDER_OPEN) {
        return Ok(sql.to_string());
    }
    let origins = OriginRegistry::new(repo).all()?;

    let mut out = String::with_capacity(sql.len());
    let mut missing = Vec::new();
    let mut rest = sql;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find(PLACEHOLDER_CLOSE) else {
            return Err(EtlError::parse(format!(
                "unterminated table placeholder in: {}",
                sql
            )));
        };
        let reference = &after[..end];
        let found = reference.rsplit_once('.').and_then(|(db, table)| {
            origins
                .iter()
                .find(|o| o.origin_database_name == db && o.origin_table_name == table)
        });
        match found {
            Some(origin) => out.push_str(&quote_name(&origin.shadow_table())),
            None => missing.push(reference.to_string()),
        }
        rest = &after[end + PLACEHOLDER_CLOSE.len()..];
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(EtlError::schema_mismatch(
            "source tables",
            missing,
            origins
                .iter()
                .map(|o| format!("{}.{}", o.origin_database_name, o.origin_table_name))
                .collect(),
        ))
    }
}
