//! SQLite repository over rusqlite

use super::schema::{
    quote_name, ColumnDefinition, ForeignKeyDefinition, SchemaDefinition, TableDefinition,
    UniqueDefinition,
};
use super::Repository;
use crate::error::{EtlError, Result};
use crate::value::{Row, Value};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed [`Repository`]
///
/// The connection lives in an `Option` so [`Repository::close`] can release it
/// while the handle is still shared.
#[derive(Debug)]
pub struct SqliteRepository {
    name: String,
    path: Option<PathBuf>,
    conn: Arc<Mutex<Option<Connection>>>,
    columns: Mutex<HashMap<String, Vec<String>>>,
}

impl SqliteRepository {
    /// Open (or create) the store file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::init(conn, path.display().to_string(), Some(path.to_path_buf()))
    }

    /// Open an existing file without write access
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Self::init(conn, path.display().to_string(), Some(path.to_path_buf()))
    }

    /// Delete the file at `path` if it exists, then open a new empty store
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::open(path)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:".to_string(), None)
    }

    fn init(conn: Connection, name: String, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        debug!(repository = %name, "opened sqlite store");
        Ok(Self {
            name,
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
            columns: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| EtlError::Other(anyhow::anyhow!("Failed to acquire database lock: {}", e)))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(EtlError::Closed(self.name.clone())),
        }
    }

    fn forget_columns(&self, table: Option<&str>) {
        if let Ok(mut cache) = self.columns.lock() {
            match table {
                Some(t) => {
                    cache.remove(t);
                },
                None => cache.clear(),
            }
        }
    }

    /// Column names of `table`, introspected once and cached until the next DDL
    fn columns_of(&self, table: &str) -> Result<Vec<String>> {
        if let Ok(cache) = self.columns.lock() {
            if let Some(columns) = cache.get(table) {
                return Ok(columns.clone());
            }
        }
        let definition = self.table(table)?;
        let columns = definition.column_names();
        if let Ok(mut cache) = self.columns.lock() {
            cache.insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }

    fn check_columns<'r>(
        &self,
        table: &str,
        names: impl Iterator<Item = &'r str>,
    ) -> Result<()> {
        let known = self.columns_of(table)?;
        for name in names {
            if !known.iter().any(|k| k == name) {
                return Err(EtlError::column_not_found(table, name));
            }
        }
        Ok(())
    }

    fn table_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn introspect(conn: &Connection, name: &str) -> Result<TableDefinition> {
        let mut table = TableDefinition::new(name);

        let mut stmt =
            conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map([name], |row| {
                Ok(ColumnDefinition {
                    name: row.get(0)?,
                    sql_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    not_null: row.get::<_, i64>(2)? != 0,
                    primary_key: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(EtlError::TableNotFound(name.to_string()));
        }
        table.columns = columns;

        let create_sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get::<_, Option<String>>(0),
            )?
            .unwrap_or_default();
        let deferred = create_sql.to_uppercase().contains("DEFERRABLE INITIALLY DEFERRED");

        let mut stmt = conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let mut fks: Vec<(i64, ForeignKeyDefinition)> = Vec::new();
        let rows = stmt.query_map([name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        for row in rows {
            let (id, ref_table, from, to, on_delete) = row?;
            let to = to.unwrap_or_default();
            match fks.iter_mut().find(|(fk_id, _)| *fk_id == id) {
                Some((_, fk)) => {
                    fk.own_columns.push(from);
                    fk.ref_columns.push(to);
                },
                None => {
                    let mut fk = ForeignKeyDefinition::new(vec![from], ref_table, vec![to]);
                    fk.deferrable = deferred;
                    if on_delete != "NO ACTION" {
                        fk.on_delete = Some(on_delete);
                    }
                    fks.push((id, fk));
                },
            }
        }
        table.foreign_keys = fks.into_iter().map(|(_, fk)| fk).collect();

        let mut stmt = conn.prepare(
            "SELECT name FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND origin = 'u' ORDER BY seq",
        )?;
        let indexes = stmt
            .query_map([name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for index in indexes {
            let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let columns = stmt
                .query_map([&index], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            table.uniques.push(UniqueDefinition { columns });
        }

        Ok(table)
    }
}

fn is_ddl(sql: &str) -> bool {
    let head = sql.trim_start().get(..6).unwrap_or_default().to_uppercase();
    matches!(head.as_str(), "CREATE" | "ALTER " | "DROP T")
}

impl Repository for SqliteRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| EtlError::Sqlite(e))?;
            debug!(repository = %self.name, "closed sqlite store");
        }
        Ok(())
    }

    fn schema(&self) -> Result<SchemaDefinition> {
        self.with_conn(|conn| {
            let mut schema = SchemaDefinition::new(self.name.clone());
            for name in Self::table_names(conn)? {
                schema.tables.push(Self::introspect(conn, &name)?);
            }
            Ok(schema)
        })
    }

    fn table(&self, name: &str) -> Result<TableDefinition> {
        self.with_conn(|conn| Self::introspect(conn, name))
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn create_table(&self, table: &TableDefinition) -> Result<()> {
        let sql = table.create_sql();
        self.with_conn(|conn| {
            conn.execute_batch(&sql)
                .map_err(|e| EtlError::execution(sql.clone(), &[], e))
        })?;
        self.forget_columns(Some(&table.name));
        debug!(repository = %self.name, table = %table.name, "created table");
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_name(name));
        self.with_conn(|conn| {
            conn.execute_batch(&sql)
                .map_err(|e| EtlError::execution(sql.clone(), &[], e))
        })?;
        self.forget_columns(Some(name));
        Ok(())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let changed = self.with_conn(|conn| {
            conn.prepare_cached(sql)
                .and_then(|mut stmt| stmt.execute(params_from_iter(params.iter())))
                .map_err(|e| EtlError::execution(sql, params, e))
        })?;
        if is_ddl(sql) {
            self.forget_columns(None);
        }
        Ok(changed)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| EtlError::execution(sql, params, e))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |r| {
                    let mut row = Row::new();
                    for (i, name) in names.iter().enumerate() {
                        row.set(name.clone(), r.get::<_, Value>(i)?);
                    }
                    Ok(row)
                })
                .and_then(|mapped| mapped.collect::<std::result::Result<Vec<_>, _>>())
                .map_err(|e| EtlError::execution(sql, params, e))?;
            Ok(rows)
        })
    }

    fn insert_row(&self, table: &str, row: &Row) -> Result<i64> {
        self.check_columns(table, row.columns())?;
        let sql = if row.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_name(table))
        } else {
            let columns: Vec<String> = row.columns().map(quote_name).collect();
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_name(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        let params: Vec<Value> = row.values().cloned().collect();
        self.with_conn(|conn| {
            conn.execute(&sql, params_from_iter(params.iter()))
                .map_err(|e| EtlError::execution(sql.clone(), &params, e))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn update_row(&self, table: &str, row: &Row, key: &Row) -> Result<usize> {
        if row.is_empty() {
            return Ok(0);
        }
        self.check_columns(table, row.columns().chain(key.columns()))?;
        let mut index = 0;
        let mut placeholder = || {
            index += 1;
            format!("?{}", index)
        };
        let assignments: Vec<String> = row
            .columns()
            .map(|c| format!("{} = {}", quote_name(c), placeholder()))
            .collect();
        let conditions: Vec<String> = key
            .columns()
            .map(|c| format!("{} = {}", quote_name(c), placeholder()))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", quote_name(table), assignments.join(", "));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let params: Vec<Value> = row.values().chain(key.values()).cloned().collect();
        self.execute(&sql, &params)
    }

    fn begin(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("BEGIN")?))
    }

    fn commit(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    fn rollback(&self) -> Result<()> {
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            Ok(())
        })
    }

    fn defer_foreign_keys(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.pragma_update(None, "defer_foreign_keys", "ON")?))
    }
}

impl Drop for SqliteRepository {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.conn.lock() {
            if let Some(conn) = guard.take() {
                let _ = conn.close();
            }
        }
    }
}
