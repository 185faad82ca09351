//! Destination table generation
//!
//! Turns the remote data model into the tables of `destination.db`: one
//! `easydb.<type>` table per object type, the satellite `asset.*` and `tag.*`
//! tables, and the fixed tables for pools, groups, users, tags and
//! collections.

use super::datamodel::{ColumnKind, EasydbSchema, ObjectType};
use super::{
    asset_table_name, l10n_column_name, object_table_name, tag_table_name, EASYDB_GOID, EASYDB_ID,
};
use crate::error::Result;
use crate::repository::{
    ColumnDefinition, ForeignKeyDefinition, SchemaDefinition, TableDefinition, UniqueDefinition,
};
use crate::source::unifier::SOURCE_UNIQUE_ID;
use crate::sync::VERSION;
use tracing::debug;

pub const POOL_TYPE: &str = "ez_pool";
pub const GROUP_TYPE: &str = "ez_group";
pub const USER_TYPE: &str = "ez_user";
pub const USER_GROUP_TYPE: &str = "ez_user__group";
pub const TAG_GROUP_TYPE: &str = "ez_tag_group";
pub const TAG_TYPE: &str = "ez_tag";
pub const COLLECTION_TYPE: &str = "ez_collection";
pub const COLLECTION_OBJECTS_TYPE: &str = "ez_collection__objects";
pub const DEPENDENCIES_TABLE: &str = "dependencies";

/// Special object types, in load order
pub const SPECIAL_TYPES: [&str; 6] = [
    POOL_TYPE,
    GROUP_TYPE,
    USER_TYPE,
    TAG_TYPE,
    COLLECTION_TYPE,
    COLLECTION_OBJECTS_TYPE,
];

/// Column of a fixed table
enum Field {
    Plain(&'static str, &'static str),
    L10n(&'static str),
}

use Field::{L10n, Plain};

const POOL_FIELDS: &[Field] = &[
    Plain("__parent_id", "text"),
    L10n("name"),
    L10n("description"),
    Plain("shortname", "text"),
    Plain("_standard_masks", "text"),
];

const GROUP_FIELDS: &[Field] = &[
    Plain("name", "text"),
    L10n("displayname"),
    Plain("comment", "text"),
];

const USER_FIELDS: &[Field] = &[
    Plain("last_name", "text"),
    Plain("first_name", "text"),
    Plain("remarks", "text"),
    Plain("login", "text"),
    Plain("email", "text"),
    Plain("phone", "text"),
    Plain("street", "text"),
    Plain("postal_code", "text"),
    Plain("town", "text"),
    Plain("country", "text"),
    Plain("password", "text"),
    Plain("frontend_prefs", "text"),
    Plain("login_disabled", "integer"),
];

const USER_GROUP_FIELDS: &[Field] = &[Plain("user_id", "text"), Plain("group_id", "text")];

const TAG_GROUP_FIELDS: &[Field] = &[Plain("type", "text"), L10n("displayname")];

const TAG_FIELDS: &[Field] = &[
    Plain("type", "text"),
    Plain("displaytype", "text"),
    L10n("displayname"),
    Plain("group", "text"),
];

const COLLECTION_FIELDS: &[Field] = &[
    L10n("displayname"),
    L10n("description"),
    Plain("__parent_id", "text"),
    Plain("__owner", "text"),
    Plain("__type", "text"),
    Plain("__owner_id", "integer"),
    Plain("__user_collection_id", "integer"),
];

const COLLECTION_OBJECTS_FIELDS: &[Field] = &[
    Plain("collection_id", "text"),
    Plain("collection_id_new", "integer"),
    Plain("object_id", "text"),
    Plain("object_goid", "text"),
    Plain("uploaded", "text"),
    Plain("position", "integer"),
];

/// Generated destination tables plus the languages they were built for
#[derive(Debug, Clone)]
pub struct DestinationSchema {
    languages: Vec<String>,
    definition: SchemaDefinition,
}

impl DestinationSchema {
    pub fn build(schema: &EasydbSchema, languages: &[String]) -> Result<Self> {
        let mut builder = Self {
            languages: languages.to_vec(),
            definition: SchemaDefinition::new("destination"),
        };
        builder.add_fixed_tables();
        for ot in &schema.objecttypes {
            builder.add_objecttype(ot);
        }
        debug!(tables = builder.definition.tables.len(), "destination schema built");
        Ok(builder)
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn table_for_objecttype(&self, name: &str) -> Option<&TableDefinition> {
        self.definition.table(&object_table_name(name))
    }

    fn base_table(name: &str) -> TableDefinition {
        TableDefinition::new(name)
            .with_column(ColumnDefinition::new(SOURCE_UNIQUE_ID, "text").primary_key())
            .with_column(ColumnDefinition::new(EASYDB_ID, "integer"))
            .with_column(ColumnDefinition::new(EASYDB_GOID, "text"))
            .with_column(ColumnDefinition::new(VERSION, "integer"))
    }

    fn add_l10n(&self, table: &mut TableDefinition, name: &str) {
        for lang in &self.languages {
            table.add_column(ColumnDefinition::new(l10n_column_name(name, lang), "text"));
        }
    }

    fn fixed_table(&self, objecttype: &str, fields: &[Field]) -> TableDefinition {
        let mut table = Self::base_table(&object_table_name(objecttype));
        for field in fields {
            match field {
                Plain(name, sql_type) => table.add_column(ColumnDefinition::new(*name, *sql_type)),
                L10n(name) => self.add_l10n(&mut table, name),
            }
        }
        table
    }

    fn add_fixed_tables(&mut self) {
        let dependencies = TableDefinition::new(DEPENDENCIES_TABLE)
            .with_column(ColumnDefinition::new("parent_table", "text"))
            .with_column(ColumnDefinition::new("parent_id", "text"))
            .with_column(ColumnDefinition::new("child_table", "text"))
            .with_column(ColumnDefinition::new("child_id", "text"));

        let tag = self.fixed_table(TAG_TYPE, TAG_FIELDS).with_foreign_key(
            ForeignKeyDefinition::single("group", object_table_name(TAG_GROUP_TYPE), SOURCE_UNIQUE_ID)
                .deferrable(),
        );

        let tables = vec![
            dependencies,
            self.fixed_table(POOL_TYPE, POOL_FIELDS),
            self.fixed_table(GROUP_TYPE, GROUP_FIELDS),
            self.fixed_table(USER_TYPE, USER_FIELDS),
            self.fixed_table(USER_GROUP_TYPE, USER_GROUP_FIELDS),
            self.fixed_table(TAG_GROUP_TYPE, TAG_GROUP_FIELDS),
            tag,
            self.fixed_table(COLLECTION_TYPE, COLLECTION_FIELDS),
            self.fixed_table(COLLECTION_OBJECTS_TYPE, COLLECTION_OBJECTS_FIELDS),
        ];
        self.definition.tables.extend(tables);
    }

    fn add_objecttype(&mut self, ot: &ObjectType) {
        let table_name = object_table_name(&ot.name);
        let mut table = Self::base_table(&table_name)
            .with_column(ColumnDefinition::new("__mask", "text"))
            .with_column(ColumnDefinition::new("__comment", "text"))
            .with_column(ColumnDefinition::new("collection_id", "text"));

        if ot.pool_link {
            table.add_column(ColumnDefinition::new("__pool_id", "text"));
        }
        if ot.is_hierarchical {
            table.add_column(ColumnDefinition::new("__parent_id", "text"));
            table.foreign_keys.push(object_link("__parent_id", &ot.name));
        }
        if let Some(owner) = &ot.owned_by {
            table.add_column(ColumnDefinition::new("__uplink_id", "text"));
            table.foreign_keys.push(object_link("__uplink_id", owner));
        }

        for column in &ot.columns {
            let ColumnKind::Column(column_type) = &column.kind else {
                continue;
            };
            if column.is_eas() {
                self.definition.tables.push(asset_table(&ot.name, &column.name));
            } else if column.is_l10n() {
                self.add_l10n(&mut table, &column.name);
            } else if !table.has_column(&column.name) {
                table.add_column(ColumnDefinition::new(
                    column.name.as_str(),
                    column_type.sql_type(),
                ));
            }
        }

        for fk in &ot.foreign_keys {
            let referenced = fk.ref_objecttype.as_deref().unwrap_or(fk.ref_table.as_str());
            let mut definition = ForeignKeyDefinition::new(
                fk.own_columns.clone(),
                object_table_name(referenced),
                fk.ref_columns.clone(),
            )
            .deferrable();
            definition.ref_objecttype = Some(referenced.to_string());
            table.foreign_keys.push(definition);
        }

        for unique in &ot.uniques {
            if unique.columns.iter().all(|c| table.has_column(c))
                && unique.columns.iter().any(|c| c != SOURCE_UNIQUE_ID)
            {
                table.uniques.push(UniqueDefinition {
                    columns: unique.columns.clone(),
                });
            }
        }

        if ot.has_tags {
            self.definition.tables.push(tag_table(&ot.name));
        }
        self.definition.tables.push(table);
    }
}

fn object_link(column: &str, objecttype: &str) -> ForeignKeyDefinition {
    let mut fk =
        ForeignKeyDefinition::single(column, object_table_name(objecttype), SOURCE_UNIQUE_ID)
            .deferrable();
    fk.ref_objecttype = Some(objecttype.to_string());
    fk
}

fn satellite_table(name: &str) -> TableDefinition {
    TableDefinition::new(name)
        .with_column(ColumnDefinition::new(SOURCE_UNIQUE_ID, "text").primary_key())
        .with_column(ColumnDefinition::new(VERSION, "integer"))
}

fn tag_table(objecttype: &str) -> TableDefinition {
    satellite_table(&tag_table_name(objecttype))
        .with_column(ColumnDefinition::new("object_id", "text"))
        .with_column(ColumnDefinition::new("tag_id", "text"))
        .with_foreign_key(object_link("object_id", objecttype))
        .with_foreign_key(object_link("tag_id", TAG_TYPE))
}

fn asset_table(objecttype: &str, column: &str) -> TableDefinition {
    satellite_table(&asset_table_name(objecttype, column))
        .with_column(ColumnDefinition::new("__eas_id", "integer"))
        .with_column(ColumnDefinition::new("object_id", "text"))
        .with_column(ColumnDefinition::new("preferred", "integer"))
        .with_column(ColumnDefinition::new("original_filename", "text"))
        .with_column(ColumnDefinition::new("source_type", "text"))
        .with_column(ColumnDefinition::new("source", "text"))
        .with_foreign_key(object_link("object_id", objecttype))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::datamodel::{ColumnType, EasydbColumn};
    use crate::repository::{Repository, SqliteRepository};

    fn languages() -> Vec<String> {
        vec!["de-DE".to_string(), "en-US".to_string()]
    }

    fn bilder() -> ObjectType {
        let mut ot = ObjectType::new("bilder");
        ot.pool_link = true;
        ot.is_hierarchical = true;
        ot.has_tags = true;
        ot.columns = vec![
            EasydbColumn {
                name: "titel".into(),
                kind: ColumnKind::Column(ColumnType::L10n("text_l10n".into())),
            },
            EasydbColumn {
                name: "fotograf".into(),
                kind: ColumnKind::Column(ColumnType::Link),
            },
            EasydbColumn {
                name: "datei".into(),
                kind: ColumnKind::Column(ColumnType::Eas),
            },
            EasydbColumn {
                name: "_nested:bilder_notiz".into(),
                kind: ColumnKind::Link {
                    other_table: "bilder_notiz".into(),
                },
            },
        ];
        let mut fk = ForeignKeyDefinition::single("fotograf", "person", SOURCE_UNIQUE_ID);
        fk.ref_objecttype = Some("person".into());
        ot.foreign_keys.push(fk);
        ot
    }

    fn schema() -> EasydbSchema {
        let mut person = ObjectType::new("person");
        person.columns.push(EasydbColumn {
            name: "name".into(),
            kind: ColumnKind::Column(ColumnType::Text("text_oneline".into())),
        });
        let mut notiz = ObjectType::new("bilder_notiz");
        notiz.owned_by = Some("bilder".into());
        EasydbSchema {
            schema_type: "user".into(),
            version: "1".into(),
            objecttypes: vec![bilder(), notiz, person],
        }
    }

    #[test]
    fn test_objecttype_table() {
        let destination = DestinationSchema::build(&schema(), &languages()).unwrap();
        let table = destination.table_for_objecttype("bilder").unwrap();
        assert_eq!(table.name, "easydb.bilder");
        assert_eq!(
            table.column_names(),
            vec![
                SOURCE_UNIQUE_ID,
                EASYDB_ID,
                EASYDB_GOID,
                VERSION,
                "__mask",
                "__comment",
                "collection_id",
                "__pool_id",
                "__parent_id",
                "titel:de-DE",
                "titel:en-US",
                "fotograf",
            ]
        );
        let fk = table.foreign_key_for("fotograf").unwrap();
        assert_eq!(fk.ref_table, "easydb.person");
        assert_eq!(fk.ref_objecttype.as_deref(), Some("person"));
        assert!(fk.deferrable);
        assert_eq!(
            table.foreign_key_for("__parent_id").unwrap().ref_table,
            "easydb.bilder"
        );

        let definition = destination.definition();
        assert!(definition.table("asset.bilder.datei").is_some());
        assert!(definition.table("tag.bilder").is_some());
        assert!(definition
            .table("easydb.bilder_notiz")
            .unwrap()
            .has_column("__uplink_id"));
    }

    #[test]
    fn test_fixed_tables_have_localized_columns() {
        let destination = DestinationSchema::build(&schema(), &languages()).unwrap();
        let pool = destination.table_for_objecttype(POOL_TYPE).unwrap();
        assert!(pool.has_column("name:de-DE"));
        assert!(pool.has_column("description:en-US"));
        assert!(pool.has_column("shortname"));
        for name in SPECIAL_TYPES {
            assert!(destination.table_for_objecttype(name).is_some(), "{}", name);
        }
        assert!(destination.definition().table(DEPENDENCIES_TABLE).is_some());
    }

    #[test]
    fn test_schema_can_be_created() {
        let destination = DestinationSchema::build(&schema(), &languages()).unwrap();
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.create_schema(destination.definition()).unwrap();
        let introspected = repo.schema().unwrap();
        introspected
            .require_tables(["easydb.bilder", "asset.bilder.datei", "tag.bilder", "easydb.ez_tag"])
            .unwrap();
    }
}
