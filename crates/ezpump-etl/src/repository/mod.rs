//! Relational store abstraction
//!
//! A [`Repository`] is the minimal interface the migration needs from a
//! relational store: schema introspection, DDL from [`TableDefinition`]s,
//! parameterized statements and row-level insert/update by field map.
//! It is opened per unit of work and released on drop.

pub mod schema;
pub mod sqlite;

pub use schema::{
    quote_name, translate_type, ColumnDefinition, ForeignKeyDefinition, SchemaDefinition,
    TableDefinition, UniqueDefinition,
};
pub use sqlite::SqliteRepository;

use crate::error::{EtlError, Result};
use crate::value::{Row, Value};
use tracing::warn;

/// Execution and introspection interface over one relational store
pub trait Repository: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Release the underlying connection; later calls fail with [`EtlError::Closed`]
    fn close(&self) -> Result<()>;

    /// Introspect all tables with columns, primary keys and constraints
    fn schema(&self) -> Result<SchemaDefinition>;

    /// Introspect one table
    fn table(&self, name: &str) -> Result<TableDefinition>;

    fn create_table(&self, table: &TableDefinition) -> Result<()>;

    fn drop_table(&self, name: &str) -> Result<()>;

    /// Run a statement with bound parameters, returning the number of changed rows
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Insert `row` into `table`, returning the new rowid
    fn insert_row(&self, table: &str, row: &Row) -> Result<i64>;

    /// Update the columns of `row` on every row matching all columns of `key`
    fn update_row(&self, table: &str, row: &Row, key: &Row) -> Result<usize>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Check foreign keys at commit instead of per statement, for the open transaction
    fn defer_foreign_keys(&self) -> Result<()>;

    fn has_table(&self, name: &str) -> Result<bool> {
        Ok(self.schema()?.table(name).is_some())
    }

    fn create_schema(&self, schema: &SchemaDefinition) -> Result<()> {
        for table in &schema.tables {
            self.create_table(table)?;
        }
        Ok(())
    }

    /// First row of `query`, if any
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// All rows of a table ordered by its primary key (or rowid)
    fn extract_table(&self, table: &str) -> Result<Vec<Row>> {
        let definition = self.table(table)?;
        let order = match definition.primary_key().as_slice() {
            [] => "rowid".to_string(),
            pk => pk.iter().map(|c| quote_name(c)).collect::<Vec<_>>().join(", "),
        };
        self.query(
            &format!("SELECT * FROM {} ORDER BY {}", quote_name(table), order),
            &[],
        )
    }
}

/// Scoped transaction: committed explicitly, rolled back on drop otherwise
pub struct Transaction<'a> {
    repo: &'a dyn Repository,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(repo: &'a dyn Repository) -> Result<Self> {
        repo.begin()?;
        Ok(Self {
            repo,
            finished: false,
        })
    }

    /// Begin with foreign key checks deferred to commit time
    pub fn begin_deferred(repo: &'a dyn Repository) -> Result<Self> {
        let tx = Self::begin(repo)?;
        repo.defer_foreign_keys()?;
        Ok(tx)
    }

    pub fn repo(&self) -> &'a dyn Repository {
        self.repo
    }

    /// Commit; a constraint violation at this point becomes [`EtlError::Integrity`]
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    /// Commit and open the next transaction on the same repository
    pub fn restart(&mut self) -> Result<()> {
        self.finish()?;
        self.repo.begin()?;
        self.finished = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        match self.repo.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rollback) = self.repo.rollback() {
                    warn!(repository = self.repo.name(), error = %rollback, "rollback after failed commit failed");
                }
                if e.is_constraint_violation() {
                    Err(EtlError::Integrity(e.to_string()))
                } else {
                    Err(e)
                }
            },
        }
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.repo.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.repo.rollback() {
                warn!(repository = self.repo.name(), error = %e, "rollback on drop failed");
            }
        }
    }
}
