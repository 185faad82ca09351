//! Error types for the migration engine
//!
//! Variants follow the failure classes a migration run distinguishes: schema
//! mismatches and protocol violations always stop the job, version conflicts
//! and execution errors obey `stop_on_error`, and asset problems are logged
//! and skipped.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Named tables or columns do not exist in the introspected schema
    #[error("Schema mismatch: {what} not found: [{missing_list}]. Available: [{available_list}]", missing_list = .missing.join(", "), available_list = .available.join(", "))]
    SchemaMismatch {
        what: String,
        missing: Vec<String>,
        available: Vec<String>,
    },

    /// Operation on a repository after `close()`
    #[error("Repository is closed: {0}")]
    Closed(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    /// A SQL statement failed; statement and bindings are kept for diagnosis
    #[error("Execution failed: {source}\n  statement: {statement}\n  params: [{param_list}]", param_list = .params.join(", "))]
    Execution {
        statement: String,
        params: Vec<String>,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Version conflict for '{source_id}': stored version {stored} is newer than incoming {incoming}")]
    VersionConflict {
        source_id: String,
        stored: i64,
        incoming: i64,
    },

    #[error("Row without __source_unique_id: {0}")]
    MissingSourceId(String),

    /// Deferred foreign key violated at commit time
    #[error("Integrity error at commit: {0} (most probably a __parent_id / __uplink_id reference to a missing row)")]
    Integrity(String),

    /// Remote response could not be matched to the request
    #[error("Remote protocol violation: {0}")]
    Protocol(String),

    #[error("Remote API error: {0}")]
    Api(String),

    #[error("Asset error: {0}")]
    Asset(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Cooperative cancellation; progress was persisted before returning
    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Batch aborted: {0}")]
    Aborted(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Foreign database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] ezpump_common::CommonError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EtlError {
    pub fn schema_mismatch(
        what: impl Into<String>,
        missing: Vec<String>,
        mut available: Vec<String>,
    ) -> Self {
        available.sort();
        Self::SchemaMismatch {
            what: what.into(),
            missing,
            available,
        }
    }

    pub fn column_not_found(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn execution(
        statement: impl Into<String>,
        params: &[crate::value::Value],
        source: rusqlite::Error,
    ) -> Self {
        Self::Execution {
            statement: statement.into(),
            params: params.iter().map(ToString::to_string).collect(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    pub fn asset(msg: impl Into<String>) -> Self {
        Self::Asset(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Errors that stop the job even when `stop_on_error` is off
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EtlError::SchemaMismatch { .. } | EtlError::Protocol(_) | EtlError::Interrupted(_)
        )
    }

    /// True for SQLite constraint violations (foreign key, unique, not null)
    pub fn is_constraint_violation(&self) -> bool {
        let sqlite = match self {
            EtlError::Sqlite(e) => e,
            EtlError::Execution { source, .. } => source,
            _ => return false,
        };
        matches!(
            sqlite.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_lists_available_sorted() {
        let err = EtlError::schema_mismatch(
            "include tables",
            vec!["d".into()],
            vec!["c".into(), "a".into(), "b".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("[d]"));
        assert!(msg.contains("Available: [a, b, c]"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_execution_error_keeps_statement_and_params() {
        let err = EtlError::execution(
            "INSERT INTO x VALUES (?)",
            &[crate::value::Value::from("a"), crate::value::Value::Null],
            rusqlite::Error::InvalidQuery,
        );
        let msg = err.to_string();
        assert!(msg.contains("INSERT INTO x VALUES (?)"));
        assert!(msg.contains("'a', NULL"));
        assert!(!err.is_fatal());
    }
}
