//! SQLite file as a foreign source

use super::{ForeignColumn, ForeignSource, ForeignTable, PageRequest};
use crate::error::Result;
use crate::repository::{quote_name, Repository, SqliteRepository};
use crate::value::Row;
use async_trait::async_trait;
use std::path::Path;

/// Foreign SQLite database, opened read-only
///
/// Tables without a declared primary key are paged in `rowid` order.
pub struct SqliteSource {
    repo: SqliteRepository,
    database: String,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let database = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            repo: SqliteRepository::open_read_only(path)?,
            database,
        })
    }

    /// Wrap an already open repository (tests, in-memory stores)
    pub fn from_repository(repo: SqliteRepository, database: impl Into<String>) -> Self {
        Self {
            repo,
            database: database.into(),
        }
    }
}

#[async_trait]
impl ForeignSource for SqliteSource {
    fn origin_type(&self) -> &str {
        "sqlite"
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn tables(&self) -> Result<Vec<ForeignTable>> {
        Ok(self
            .repo
            .schema()?
            .tables
            .into_iter()
            .map(|t| ForeignTable {
                primary_key: t.primary_key().iter().map(|c| c.to_string()).collect(),
                columns: t
                    .columns
                    .into_iter()
                    .map(|c| ForeignColumn::new(c.name, c.sql_type))
                    .collect(),
                name: t.name,
            })
            .collect())
    }

    async fn fetch_page(&self, table: &ForeignTable, page: &PageRequest) -> Result<Vec<Row>> {
        let columns: Vec<String> = table.columns.iter().map(|c| quote_name(&c.name)).collect();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote_name(&table.name));
        if let Some(filter) = &page.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        let order = match &page.order_by {
            Some(order) => order.clone(),
            None if page.key.is_empty() => "rowid".to_string(),
            None => page
                .key
                .iter()
                .map(|k| quote_name(k))
                .collect::<Vec<_>>()
                .join(", "),
        };
        sql.push_str(&format!(
            " ORDER BY {} LIMIT {} OFFSET {}",
            order, page.limit, page.offset
        ));
        self.repo.query(&sql, &[])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tables_and_paging() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.execute("CREATE TABLE b (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        repo.execute("CREATE TABLE a (x TEXT)", &[]).unwrap();
        for (id, name) in [(3, "c"), (1, "a"), (2, "b")] {
            repo.execute(
                "INSERT INTO b VALUES (?1, ?2)",
                &[id.into(), name.into()],
            )
            .unwrap();
        }
        let source = SqliteSource::from_repository(repo, "test.sqlite");

        let tables = source.tables().await.unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "a");
        assert!(tables[0].primary_key.is_empty());
        assert_eq!(tables[1].primary_key, ["id"]);

        let page = PageRequest {
            key: tables[1].primary_key.clone(),
            limit: 2,
            offset: 1,
            ..PageRequest::default()
        };
        let rows = source.fetch_page(&tables[1], &page).await.unwrap();
        let names: Vec<String> = rows.iter().filter_map(|r| r.text("name")).collect();
        assert_eq!(names, ["b", "c"]);
    }
}
