//! Join plan for loading one object type
//!
//! The base table is aliased `t0`. Every pool link, hierarchical parent and
//! foreign-key-backed link column adds one `LEFT JOIN` whose `__easydb_id`
//! is projected under the name of the referencing column, so the loaded row
//! already holds remote ids. Link columns also carry their source value
//! under [`link_source_name`], which tells an unset link apart from a target
//! that has no remote id yet. Every name is checked against the destination
//! table definition before it is formatted into SQL.

use crate::destination::schema::POOL_TYPE;
use crate::destination::{l10n_column_name, object_table_name, ColumnKind, ObjectType, EASYDB_ID};
use crate::error::{EtlError, Result};
use crate::repository::{quote_name, TableDefinition};
use crate::source::unifier::SOURCE_UNIQUE_ID;

/// Output name of the source value behind link column `column`
pub fn link_source_name(column: &str) -> String {
    format!("__link:{}", column)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub alias: String,
    /// Column of the joined table matched against `t0`
    pub column: String,
    /// Column of `t0`
    pub own_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectColumn {
    pub alias: String,
    pub column: String,
    /// Output name
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct JoinPlan {
    table: String,
    nested: bool,
    columns: Vec<SelectColumn>,
    joins: Vec<Join>,
}

impl JoinPlan {
    /// Plan for top-level objects of `objecttype`
    pub fn build(objecttype: &ObjectType, table: &TableDefinition, languages: &[String]) -> Result<Self> {
        Self::plan(objecttype, table, languages, false)
    }

    /// Plan for objects nested in their owner through `__uplink_id`
    pub fn build_nested(objecttype: &ObjectType, table: &TableDefinition, languages: &[String]) -> Result<Self> {
        Self::plan(objecttype, table, languages, true)
    }

    fn plan(objecttype: &ObjectType, table: &TableDefinition, languages: &[String], nested: bool) -> Result<Self> {
        let mut plan = Self {
            table: table.name.clone(),
            nested,
            columns: Vec::new(),
            joins: Vec::new(),
        };

        plan.base_column(table, SOURCE_UNIQUE_ID)?;
        if nested {
            plan.base_column(table, "__uplink_id")?;
        } else {
            plan.base_column(table, "__comment")?;
            plan.base_column(table, "__mask")?;
        }

        if objecttype.pool_link && !nested {
            table.require_column("__pool_id")?;
            plan.join(object_table_name(POOL_TYPE), SOURCE_UNIQUE_ID, "__pool_id");
        }
        if objecttype.is_hierarchical {
            table.require_column("__parent_id")?;
            plan.join(table.name.clone(), SOURCE_UNIQUE_ID, "__parent_id");
        }

        for column in &objecttype.columns {
            let ColumnKind::Column(_) = &column.kind else {
                continue;
            };
            if column.is_eas() {
                continue;
            }
            if column.is_link_column() {
                table.require_column(&column.name)?;
                let fk = table.foreign_key_for(&column.name).ok_or_else(|| {
                    EtlError::schema_mismatch(
                        format!("foreign keys of '{}'", table.name),
                        vec![column.name.clone()],
                        table
                            .foreign_keys
                            .iter()
                            .flat_map(|fk| fk.own_columns.iter().cloned())
                            .collect(),
                    )
                })?;
                let ref_column = fk
                    .ref_columns
                    .first()
                    .cloned()
                    .unwrap_or_else(|| SOURCE_UNIQUE_ID.to_string());
                plan.join(fk.ref_table.clone(), &ref_column, &column.name);
                plan.columns.push(SelectColumn {
                    alias: "t0".to_string(),
                    column: column.name.clone(),
                    name: link_source_name(&column.name),
                });
            } else if column.is_l10n() {
                for lang in languages {
                    plan.base_column(table, &l10n_column_name(&column.name, lang))?;
                }
            } else {
                plan.base_column(table, &column.name)?;
            }
        }
        Ok(plan)
    }

    fn base_column(&mut self, table: &TableDefinition, column: &str) -> Result<()> {
        table.require_column(column)?;
        self.columns.push(SelectColumn {
            alias: "t0".to_string(),
            column: column.to_string(),
            name: column.to_string(),
        });
        Ok(())
    }

    fn join(&mut self, table: String, column: &str, own_column: &str) {
        let alias = format!("t{}", self.joins.len() + 1);
        self.columns.push(SelectColumn {
            alias: alias.clone(),
            column: EASYDB_ID.to_string(),
            name: own_column.to_string(),
        });
        self.joins.push(Join {
            table,
            alias,
            column: column.to_string(),
            own_column: own_column.to_string(),
        });
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn select_from(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}.{} AS {}", c.alias, quote_name(&c.column), quote_name(&c.name)))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {} t0",
            columns.join(", "),
            quote_name(&self.table)
        );
        for join in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {}.{} = t0.{}",
                quote_name(&join.table),
                join.alias,
                join.alias,
                quote_name(&join.column),
                quote_name(&join.own_column)
            ));
        }
        sql
    }

    /// Rows for `count` source ids, bound as parameters
    pub fn sql_for_ids(&self, count: usize) -> String {
        let placeholders = vec!["?"; count.max(1)].join(", ");
        format!(
            "{} WHERE t0.{} IN ({}) ORDER BY t0.{}",
            self.select_from(),
            quote_name(SOURCE_UNIQUE_ID),
            placeholders,
            quote_name(SOURCE_UNIQUE_ID)
        )
    }

    /// Nested rows of one owner, bound as the single parameter
    pub fn sql_for_owner(&self) -> Result<String> {
        if !self.nested {
            return Err(EtlError::config(format!(
                "{} is not planned as nested",
                self.table
            )));
        }
        Ok(format!(
            "{} WHERE t0.{} = ? ORDER BY t0.{}",
            self.select_from(),
            quote_name("__uplink_id"),
            quote_name(SOURCE_UNIQUE_ID)
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::{ColumnType, DestinationSchema, EasydbColumn, EasydbSchema};
    use crate::repository::ForeignKeyDefinition;

    fn schema() -> EasydbSchema {
        let mut objekte = ObjectType::new("objekte");
        objekte.pool_link = true;
        objekte.is_hierarchical = true;
        objekte.columns = vec![
            EasydbColumn {
                name: "titel".into(),
                kind: ColumnKind::Column(ColumnType::L10n("text_l10n".into())),
            },
            EasydbColumn {
                name: "owner".into(),
                kind: ColumnKind::Column(ColumnType::Link),
            },
            EasydbColumn {
                name: "datei".into(),
                kind: ColumnKind::Column(ColumnType::Eas),
            },
            EasydbColumn {
                name: "inventar".into(),
                kind: ColumnKind::Column(ColumnType::Text("text".into())),
            },
        ];
        let mut fk = ForeignKeyDefinition::single("owner", "user", SOURCE_UNIQUE_ID);
        fk.ref_objecttype = Some("user".into());
        objekte.foreign_keys.push(fk);

        EasydbSchema {
            schema_type: "user".into(),
            version: "1".into(),
            objecttypes: vec![objekte, ObjectType::new("user")],
        }
    }

    #[test]
    fn test_pool_parent_and_link_joins() {
        let schema = schema();
        let languages = vec!["de-DE".to_string()];
        let destination = DestinationSchema::build(&schema, &languages).unwrap();
        let ot = schema.objecttype("objekte").unwrap();
        let table = destination.table_for_objecttype("objekte").unwrap();

        let plan = JoinPlan::build(ot, table, &languages).unwrap();
        let joins = plan.joins();
        assert_eq!(joins.len(), 3);
        assert_eq!((joins[0].alias.as_str(), joins[0].table.as_str()), ("t1", "easydb.ez_pool"));
        assert_eq!((joins[1].alias.as_str(), joins[1].table.as_str()), ("t2", "easydb.objekte"));
        assert_eq!((joins[2].alias.as_str(), joins[2].table.as_str()), ("t3", "easydb.user"));

        let columns = plan.column_names();
        assert_eq!(&columns[..2], &[SOURCE_UNIQUE_ID, "__comment"]);
        assert!(columns.contains(&"titel:de-DE"));
        assert!(columns.contains(&"inventar"));
        assert!(columns.contains(&"__link:owner"));
        assert!(!columns.contains(&"datei"));

        let sql = plan.sql_for_ids(2);
        assert!(sql.contains("LEFT JOIN \"easydb.ez_pool\" t1 ON t1.\"__source_unique_id\" = t0.\"__pool_id\""));
        assert!(sql.contains("t3.\"__easydb_id\" AS \"owner\""));
        assert!(sql.contains("t0.\"owner\" AS \"__link:owner\""));
        assert!(sql.ends_with("IN (?, ?) ORDER BY t0.\"__source_unique_id\""));
        assert!(plan.sql_for_owner().is_err());
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let schema = schema();
        let ot = schema.objecttype("objekte").unwrap();
        let table = TableDefinition::new("easydb.objekte");
        assert!(JoinPlan::build(ot, &table, &[]).is_err());
    }
}
