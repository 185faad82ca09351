//! PostgreSQL and MySQL sources over `sqlx::Any`
//!
//! Schema comes from `information_schema`. Every value is cast to text in the
//! foreign database so one code path reads all column types.

use super::{ForeignColumn, ForeignSource, ForeignTable, PageRequest};
use crate::error::{EtlError, Result};
use crate::value::{Row, Value};
use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyPool;
use sqlx::Row as _;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
}

impl SqlDialect {
    /// Dialect from the scheme of a connection URL
    pub fn from_url(url: &url::Url) -> Result<Self> {
        match url.scheme() {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mysql" | "mariadb" => Ok(SqlDialect::MySql),
            other => Err(EtlError::config(format!(
                "unsupported database scheme '{}' (expected postgres or mysql)",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SqlDialect::Postgres => "postgres",
            SqlDialect::MySql => "mysql",
        }
    }

    pub fn quote(self, name: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            SqlDialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    fn placeholder(self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", n),
            SqlDialect::MySql => "?".to_string(),
        }
    }

    /// Cast an expression to text
    fn cast_text(self, expr: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("CAST({} AS TEXT)", expr),
            SqlDialect::MySql => format!("CAST({} AS CHAR)", expr),
        }
    }

    fn as_text(self, column: &str) -> String {
        self.cast_text(&self.quote(column))
    }
}

/// Foreign SQL database reached through a connection URL
pub struct SqlSource {
    pool: AnyPool,
    dialect: SqlDialect,
    database: String,
    schema: String,
}

impl SqlSource {
    /// Connect to `postgres://...` or `mysql://...`
    ///
    /// `schema` defaults to `public` for PostgreSQL and to the database name
    /// for MySQL.
    pub async fn connect(database_url: &str, schema: Option<&str>) -> Result<Self> {
        let url = url::Url::parse(database_url)
            .map_err(|e| EtlError::config(format!("invalid database url: {}", e)))?;
        let dialect = SqlDialect::from_url(&url)?;
        let database = url.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(EtlError::config("database url has no database name"));
        }
        let schema = schema.map(str::to_string).unwrap_or_else(|| match dialect {
            SqlDialect::Postgres => "public".to_string(),
            SqlDialect::MySql => database.clone(),
        });

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        info!(dialect = dialect.as_str(), database = %database, schema = %schema, "connected to foreign database");

        Ok(Self {
            pool,
            dialect,
            database,
            schema,
        })
    }

    async fn text_rows(&self, sql: &str, binds: &[&str]) -> Result<Vec<Vec<Option<String>>>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind.to_string());
        }
        let rows: Vec<AnyRow> = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map_err(EtlError::from))
                    .collect()
            })
            .collect()
    }

    async fn columns(&self, table: &str) -> Result<Vec<ForeignColumn>> {
        let sql = format!(
            "SELECT {}, {} FROM information_schema.columns WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
            self.dialect.cast_text("column_name"),
            self.dialect.cast_text("data_type"),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
        );
        Ok(self
            .text_rows(&sql, &[&self.schema, table])
            .await?
            .into_iter()
            .filter_map(|mut r| {
                let sql_type = r.pop().flatten().unwrap_or_default();
                let name = r.pop().flatten()?;
                Some(ForeignColumn::new(name, sql_type))
            })
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT {} FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
              AND tc.table_name = kcu.table_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = {} AND tc.table_name = {} \
             ORDER BY kcu.ordinal_position",
            self.dialect.cast_text("kcu.column_name"),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
        );
        Ok(self
            .text_rows(&sql, &[&self.schema, table])
            .await?
            .into_iter()
            .filter_map(|mut r| r.pop().flatten())
            .collect())
    }
}

#[async_trait]
impl ForeignSource for SqlSource {
    fn origin_type(&self) -> &str {
        self.dialect.as_str()
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn tables(&self) -> Result<Vec<ForeignTable>> {
        let sql = format!(
            "SELECT {} FROM information_schema.tables WHERE table_schema = {} AND table_type = 'BASE TABLE' ORDER BY table_name",
            self.dialect.cast_text("table_name"),
            self.dialect.placeholder(1),
        );
        let names: Vec<String> = self
            .text_rows(&sql, &[&self.schema])
            .await?
            .into_iter()
            .filter_map(|mut r| r.pop().flatten())
            .collect();

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = self.columns(&name).await?;
            let primary_key = self.primary_key(&name).await?;
            debug!(table = %name, columns = columns.len(), key = ?primary_key, "introspected foreign table");
            tables.push(ForeignTable {
                name,
                columns,
                primary_key,
            });
        }
        Ok(tables)
    }

    async fn fetch_page(&self, table: &ForeignTable, page: &PageRequest) -> Result<Vec<Row>> {
        let projection: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} AS {}", self.dialect.as_text(&c.name), self.dialect.quote(&c.name)))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}.{}",
            projection.join(", "),
            self.dialect.quote(&self.schema),
            self.dialect.quote(&table.name)
        );
        if let Some(filter) = &page.filter {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        match (&page.order_by, page.key.is_empty()) {
            (Some(order), _) => {
                sql.push_str(" ORDER BY ");
                sql.push_str(order);
            },
            (None, false) => {
                let key: Vec<String> = page.key.iter().map(|k| self.dialect.quote(k)).collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&key.join(", "));
            },
            (None, true) => {},
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.offset));

        let rows = self.text_rows(&sql, &[]).await?;
        Ok(rows
            .into_iter()
            .map(|values| {
                table
                    .columns
                    .iter()
                    .zip(values)
                    .map(|(c, v)| (c.name.clone(), Value::from(v)))
                    .collect()
            })
            .collect())
    }
}
