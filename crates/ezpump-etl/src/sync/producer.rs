//! Row producers feeding the synchronizer

use crate::error::Result;
use crate::repository::Repository;
use crate::source::resolve_placeholders;
use crate::value::{Row, Value};

pub trait RowProducer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn rows(&self) -> Result<Vec<Row>>;
}

/// A fixed list of rows
pub struct FixedRows {
    name: String,
    rows: Vec<Row>,
}

impl FixedRows {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }
}

impl RowProducer for FixedRows {
    fn name(&self) -> &str {
        &self.name
    }

    fn rows(&self) -> Result<Vec<Row>> {
        Ok(self.rows.clone())
    }
}

/// Rows of a query against the intermediate store
///
/// `[[table:<database>.<table>]]` placeholders in the SQL are resolved to
/// shadow table names before the query runs.
pub struct QueryRows<'a> {
    name: String,
    repo: &'a dyn Repository,
    sql: String,
    params: Vec<Value>,
}

impl<'a> QueryRows<'a> {
    pub fn new(name: impl Into<String>, repo: &'a dyn Repository, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

impl RowProducer for QueryRows<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn rows(&self) -> Result<Vec<Row>> {
        let sql = resolve_placeholders(self.repo, &self.sql)?;
        self.repo.query(&sql, &self.params)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::EtlError;
    use crate::intermediate::IntermediateStore;
    use crate::source::OriginRegistry;

    #[test]
    fn test_query_rows_resolves_placeholders() {
        let store = IntermediateStore::in_memory().unwrap();
        let repo = store.repo();
        let origin = OriginRegistry::new(repo)
            .register("sqlite", "lib", "books", "library")
            .unwrap();
        repo.execute(
            &format!(
                "CREATE TABLE \"{}\" (title TEXT, __source_unique_id TEXT)",
                origin.shadow_table()
            ),
            &[],
        )
        .unwrap();
        repo.execute(
            &format!(
                "INSERT INTO \"{}\" VALUES ('Faust', '1'), ('Woyzeck', '2')",
                origin.shadow_table()
            ),
            &[],
        )
        .unwrap();

        let producer = QueryRows::new(
            "books",
            repo,
            "SELECT * FROM [[table:lib.books]] WHERE __source_unique_id = ?",
        )
        .with_params(vec![Value::from("2")]);
        let rows = producer.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("title").as_deref(), Some("Woyzeck"));
    }

    #[test]
    fn test_query_rows_unknown_placeholder() {
        let store = IntermediateStore::in_memory().unwrap();
        let producer = QueryRows::new("x", store.repo(), "SELECT * FROM [[table:lib.nothing]]");
        assert!(matches!(
            producer.rows(),
            Err(EtlError::SchemaMismatch { .. })
        ));
    }
}
