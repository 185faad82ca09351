//! Row-level transformations
//!
//! A transformation turns one row into zero (drop), one (rewrite) or several
//! (fan-out) rows. Transformations are applied in order; every row produced
//! by one step is fed to the next.

use crate::error::Result;
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::value::{Row, Value};
use std::collections::HashSet;

pub trait RowTransformation: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn transform(&self, row: Row) -> Result<Vec<Row>>;
}

/// Run `row` through every transformation in order
pub fn apply_pipeline(transformations: &[Box<dyn RowTransformation>], row: Row) -> Result<Vec<Row>> {
    let mut rows = vec![row];
    for transformation in transformations {
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            next.extend(transformation.transform(row)?);
        }
        if next.is_empty() {
            tracing::debug!(transformation = transformation.name(), "row dropped");
            return Ok(next);
        }
        rows = next;
    }
    Ok(rows)
}

/// Set constant values
pub struct FixValues {
    values: Row,
}

impl FixValues {
    pub fn new(values: Row) -> Self {
        Self { values }
    }
}

impl RowTransformation for FixValues {
    fn name(&self) -> &str {
        "fix-values"
    }

    fn transform(&self, mut row: Row) -> Result<Vec<Row>> {
        for (column, value) in self.values.iter() {
            row.set(column, value.clone());
        }
        Ok(vec![row])
    }
}

/// Drop rows whose listed columns are all null or blank
pub struct FilterByEmptyColumns {
    columns: Vec<String>,
}

impl FilterByEmptyColumns {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for FilterByEmptyColumns {
    fn default() -> Self {
        Self::new([SOURCE_UNIQUE_ID])
    }
}

impl RowTransformation for FilterByEmptyColumns {
    fn name(&self) -> &str {
        "filter-empty-columns"
    }

    fn transform(&self, row: Row) -> Result<Vec<Row>> {
        let all_empty = self
            .columns
            .iter()
            .all(|c| row.get(c).map_or(true, Value::is_blank));
        Ok(if all_empty { Vec::new() } else { vec![row] })
    }
}

/// Drop rows with an excluded `__source_unique_id`
pub struct FilterBySourceId {
    exclude: HashSet<String>,
}

impl FilterBySourceId {
    pub fn new<I, S>(exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }
}

impl RowTransformation for FilterBySourceId {
    fn name(&self) -> &str {
        "filter-by-source-id"
    }

    fn transform(&self, row: Row) -> Result<Vec<Row>> {
        let excluded = row
            .text(SOURCE_UNIQUE_ID)
            .is_some_and(|id| self.exclude.contains(&id));
        Ok(if excluded { Vec::new() } else { vec![row] })
    }
}

/// Rename one column; rows without it pass unchanged
pub struct Rename {
    from: String,
    to: String,
}

impl Rename {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl RowTransformation for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    fn transform(&self, mut row: Row) -> Result<Vec<Row>> {
        row.rename(&self.from, self.to.clone());
        Ok(vec![row])
    }
}

type TransformFn = dyn Fn(Row) -> Result<Vec<Row>> + Send + Sync;

/// Closure adapter for one-off transformations
pub struct MapFn {
    name: String,
    f: Box<TransformFn>,
}

impl MapFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Row) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl RowTransformation for MapFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, row: Row) -> Result<Vec<Row>> {
        (self.f)(row)
    }
}
