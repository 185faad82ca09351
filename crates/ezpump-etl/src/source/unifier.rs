//! Copy foreign tables into shadow tables of the intermediate store

use super::origin::OriginRegistry;
use super::{
    unique_id_from_key, ForeignSource, ForeignTable, ImportOptions, PageRequest, TableOverride,
    TABLE_NAME_PLACEHOLDER,
};
use crate::error::{EtlError, Result};
use crate::intermediate::IntermediateStore;
use crate::repository::{
    quote_name, translate_type, ColumnDefinition, Repository, TableDefinition, Transaction,
    UniqueDefinition,
};
use chrono::Utc;
use tracing::{info, warn};

pub const SOURCE_UNIQUE_ID: &str = "__source_unique_id";
pub const SOURCE_INSERTED_TIME: &str = "__source_inserted_time";

/// Rows copied per shadow table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub tables: Vec<(String, usize)>,
    /// Rows skipped because their unique id was already present
    pub duplicates: usize,
}

impl ImportReport {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|(_, n)| n).sum()
    }
}

/// Imports one foreign source under a source name
pub struct SourceUnifier<'a> {
    store: &'a IntermediateStore,
    source_name: String,
    options: ImportOptions,
}

impl<'a> SourceUnifier<'a> {
    pub fn new(store: &'a IntermediateStore, source_name: impl Into<String>, options: ImportOptions) -> Self {
        Self {
            store,
            source_name: source_name.into(),
            options,
        }
    }

    /// Tables to import, in name order
    ///
    /// Fails before anything is created when a named table does not exist,
    /// listing every missing name and every available table.
    pub fn select_tables(&self, tables: Vec<ForeignTable>) -> Result<Vec<ForeignTable>> {
        let available: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
        let mut missing: Vec<String> = self
            .options
            .named_tables()
            .filter(|name| !available.iter().any(|a| a == name))
            .map(str::to_string)
            .collect();
        missing.dedup();
        if !missing.is_empty() {
            return Err(EtlError::schema_mismatch(
                "tables in source",
                missing,
                available,
            ));
        }

        let mut selected: Vec<ForeignTable> = tables
            .into_iter()
            .filter(|t| self.options.is_selected(&t.name))
            .collect();
        selected.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(selected)
    }

    pub async fn import(&self, source: &dyn ForeignSource) -> Result<ImportReport> {
        info!(
            source = %self.source_name,
            origin_type = source.origin_type(),
            database = source.database_name(),
            "importing source"
        );
        let tables = self.select_tables(source.tables().await?)?;

        let mut report = ImportReport::default();
        for table in &tables {
            let table_override = self.options.override_for(&table.name);
            let (shadow, rows, duplicates) = self.import_table(source, table, &table_override).await?;
            info!(table = %table.name, shadow = %shadow, rows, "copied table");
            report.tables.push((shadow, rows));
            report.duplicates += duplicates;
        }
        Ok(report)
    }

    fn key_columns(table: &ForeignTable, table_override: &TableOverride) -> Result<Vec<String>> {
        let key = table_override
            .key
            .clone()
            .unwrap_or_else(|| table.primary_key.clone());
        let missing: Vec<String> = key.iter().filter(|k| !table.has_column(k)).cloned().collect();
        if !missing.is_empty() {
            return Err(EtlError::schema_mismatch(
                format!("key columns of table '{}'", table.name),
                missing,
                table.column_names(),
            ));
        }
        Ok(key)
    }

    fn shadow_definition(name: &str, table: &ForeignTable) -> TableDefinition {
        let mut definition = TableDefinition::new(name);
        for column in &table.columns {
            definition.add_column(ColumnDefinition::new(
                column.name.as_str(),
                translate_type(&column.sql_type),
            ));
        }
        definition.add_column(ColumnDefinition::new(SOURCE_UNIQUE_ID, "text"));
        definition.add_column(ColumnDefinition::new(SOURCE_INSERTED_TIME, "text"));
        definition.uniques.push(UniqueDefinition {
            columns: vec![SOURCE_UNIQUE_ID.to_string()],
        });
        definition
    }

    /// One transaction per table: register, recreate, copy
    async fn import_table(
        &self,
        source: &dyn ForeignSource,
        table: &ForeignTable,
        table_override: &TableOverride,
    ) -> Result<(String, usize, usize)> {
        let key = Self::key_columns(table, table_override)?;
        if key.is_empty() {
            warn!(table = %table.name, "table has no key, __source_unique_id stays empty");
        }

        let repo = self.store.repo();
        let tx = Transaction::begin(repo)?;

        let origin = OriginRegistry::new(repo).register(
            source.origin_type(),
            source.database_name(),
            &table.name,
            &self.source_name,
        )?;
        let shadow = origin.shadow_table();
        repo.drop_table(&shadow)?;
        repo.create_table(&Self::shadow_definition(&shadow, table))?;

        if let Some(on_create) = &table_override.on_create {
            let sql = on_create.replace(TABLE_NAME_PLACEHOLDER, &quote_name(&shadow));
            repo.execute(&sql, &[])?;
        }

        let inserted_time = Utc::now().to_rfc3339();
        let page_size = self.options.page_size.max(1);
        let mut copied = 0;
        let mut duplicates = 0;
        let mut offset = 0;
        loop {
            let limit = match table_override.limit {
                Some(max) => page_size.min(max.saturating_sub(offset)),
                None => page_size,
            };
            if limit == 0 {
                break;
            }
            let page = PageRequest {
                filter: table_override.filter.clone(),
                order_by: table_override.orderby.clone(),
                key: key.clone(),
                limit,
                offset,
            };
            let rows = source.fetch_page(table, &page).await?;
            let fetched = rows.len();

            for mut row in rows {
                let unique_id = unique_id_from_key(&row, &key);
                row.set(SOURCE_UNIQUE_ID, unique_id.clone());
                row.set(SOURCE_INSERTED_TIME, inserted_time.as_str());
                match repo.insert_row(&shadow, &row) {
                    Ok(_) => copied += 1,
                    Err(e) if e.is_constraint_violation() => {
                        warn!(table = %shadow, unique_id = ?unique_id, "duplicate __source_unique_id, row skipped");
                        duplicates += 1;
                    },
                    Err(e) => return Err(e),
                }
            }

            offset += fetched;
            if fetched < limit {
                break;
            }
        }

        tx.commit()?;
        Ok((shadow, copied, duplicates))
    }
}
