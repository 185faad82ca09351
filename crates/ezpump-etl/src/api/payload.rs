//! Request payloads
//!
//! Builds the JSON bodies the target system expects from destination rows.
//! Localized fields are stored as one `<name>:<lang>` column per language and
//! sent as a `{lang: text}` map.

use crate::destination::{l10n_column_name, ColumnType, EasydbColumn, ObjectType};
use crate::error::{EtlError, Result};
use crate::value::{Row, Value};
use serde_json::{json, Map, Value as JsonValue};

/// Mask used when an object row does not name one
pub const DEFAULT_MASK: &str = "_all_fields";

/// Version sent for newly created records
const NEW_VERSION: i64 = 1;

/// `{lang: text}` from the `<column>:<lang>` cells of `row`
pub fn l10n_map(row: &Row, column: &str, languages: &[String]) -> JsonValue {
    let map: Map<String, JsonValue> = languages
        .iter()
        .map(|lang| (lang.clone(), row.value(&l10n_column_name(column, lang)).to_json()))
        .collect();
    JsonValue::Object(map)
}

/// Asset field: `[{"_id", "preferred"}]`
pub fn asset_value(assets: &[(i64, bool)]) -> JsonValue {
    JsonValue::Array(
        assets
            .iter()
            .map(|(id, preferred)| json!({"_id": id, "preferred": preferred}))
            .collect(),
    )
}

/// Convert one stored value of a scalar column
///
/// `link_target` is the object type a link column references; link values are
/// remote ids already.
pub fn field_value(column: &EasydbColumn, value: &Value, link_target: Option<&str>) -> Result<JsonValue> {
    let Some(column_type) = column.column_type() else {
        return Err(EtlError::config(format!(
            "column '{}' is not a scalar column",
            column.name
        )));
    };
    let converted = match column_type {
        ColumnType::Link => {
            let target = link_target.ok_or_else(|| {
                EtlError::schema_mismatch(
                    "foreign keys",
                    vec![column.name.clone()],
                    Vec::new(),
                )
            })?;
            match value.as_i64() {
                Some(id) => json!({ target: {"_id": id} }),
                None => JsonValue::Null,
            }
        },
        ColumnType::Date | ColumnType::Datetime => match value.as_text() {
            Some(s) if !s.is_empty() => json!({"value": s}),
            _ => JsonValue::Null,
        },
        ColumnType::Decimal => {
            if value.is_blank() {
                JsonValue::Null
            } else {
                let f = value.as_f64().ok_or_else(|| {
                    EtlError::parse(format!("{}: '{}' is not a decimal", column.name, value))
                })?;
                JsonValue::from(f)
            }
        },
        ColumnType::Daterange => match value.as_text() {
            Some(s) => {
                let (from, to) = s.split_once('|').unwrap_or((s.as_str(), s.as_str()));
                json!({"from": from, "to": to})
            },
            None => JsonValue::Null,
        },
        ColumnType::Boolean => JsonValue::Bool(value.as_bool().unwrap_or(false)),
        ColumnType::Integer => {
            if value.is_blank() {
                JsonValue::Null
            } else {
                let i = value.as_i64().ok_or_else(|| {
                    EtlError::parse(format!("{}: '{}' is not an integer", column.name, value))
                })?;
                JsonValue::from(i)
            }
        },
        ColumnType::Eas | ColumnType::L10n(_) | ColumnType::Text(_) => value.to_json(),
    };
    Ok(converted)
}

/// One object to create
#[derive(Debug, Clone)]
pub struct ObjectPayload {
    pub objecttype: String,
    pub source_id: String,
    pub mask: String,
    pub pool_link: bool,
    pub parent_id: Option<i64>,
    pub pool_id: Option<i64>,
    pub comment: Option<String>,
    pub tags: Vec<i64>,
    pub fields: Map<String, JsonValue>,
}

impl ObjectPayload {
    pub fn new(objecttype: &ObjectType, source_id: impl Into<String>) -> Self {
        Self {
            objecttype: objecttype.name.clone(),
            source_id: source_id.into(),
            mask: DEFAULT_MASK.to_string(),
            pool_link: objecttype.pool_link,
            parent_id: None,
            pool_id: None,
            comment: None,
            tags: Vec::new(),
            fields: Map::new(),
        }
    }

    pub fn with_mask(mut self, mask: Option<String>) -> Self {
        if let Some(mask) = mask.filter(|m| !m.trim().is_empty()) {
            self.mask = mask;
        }
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: JsonValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    /// Append one nested object to `_nested:<type>`
    pub fn push_nested(&mut self, column: &str, nested: JsonValue) {
        let entry = self
            .fields
            .entry(column.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if let JsonValue::Array(items) = entry {
            items.push(nested);
        }
    }

    /// Top-level payload for `POST db/<type>`
    pub fn to_json(&self) -> Result<JsonValue> {
        let mut inner = Map::new();
        inner.insert("_id".into(), JsonValue::Null);
        inner.insert("_version".into(), JsonValue::from(NEW_VERSION));
        if let Some(parent) = self.parent_id {
            inner.insert("_id_parent".into(), JsonValue::from(parent));
        }
        if self.pool_link {
            let pool = self.pool_id.ok_or_else(|| {
                EtlError::config(format!(
                    "{} '{}' has no pool",
                    self.objecttype, self.source_id
                ))
            })?;
            inner.insert("_pool".into(), json!({"pool": {"_id": pool}}));
        }
        for (name, value) in &self.fields {
            inner.insert(name.clone(), value.clone());
        }

        let mut js = Map::new();
        js.insert("_mask".into(), JsonValue::from(self.mask.as_str()));
        js.insert(self.objecttype.clone(), JsonValue::Object(inner));
        if let Some(comment) = &self.comment {
            js.insert("_comment".into(), JsonValue::from(comment.as_str()));
        }
        if !self.tags.is_empty() {
            js.insert(
                "_tags".into(),
                JsonValue::Array(self.tags.iter().map(|id| json!({"_id": id})).collect()),
            );
        }
        Ok(JsonValue::Object(js))
    }

    /// Field map used inside the owner's `_nested:<type>` array
    pub fn to_nested_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

fn parse_json_cell(row: &Row, column: &str) -> Result<Option<JsonValue>> {
    match row.text(column) {
        Some(s) if !s.trim().is_empty() => Ok(Some(serde_json::from_str(&s).map_err(|e| {
            EtlError::parse(format!("{}: invalid JSON: {}", column, e))
        })?)),
        _ => Ok(None),
    }
}

/// Pool row with `__parent_id` already resolved to the parent's remote id
pub fn pool_payload(row: &Row, languages: &[String], root_pool_id: i64) -> Result<JsonValue> {
    let parent = row.integer("__parent_id").unwrap_or(root_pool_id);
    let mut js = json!({
        "pool": {
            "_id": null,
            "_version": NEW_VERSION,
            "name": l10n_map(row, "name", languages),
            "description": l10n_map(row, "description", languages),
            "shortname": row.value("shortname").to_json(),
            "_id_parent": parent,
        }
    });
    if let Some(masks) = parse_json_cell(row, "_standard_masks")? {
        js["_standard_masks"] = masks;
    }
    Ok(js)
}

pub fn group_payload(row: &Row, languages: &[String]) -> JsonValue {
    json!({
        "group": {
            "_id": null,
            "_version": NEW_VERSION,
            "displayname": l10n_map(row, "displayname", languages),
            "comment": row.value("comment").to_json(),
        }
    })
}

/// User row plus the remote ids of its groups
pub fn user_payload(row: &Row, group_ids: &[i64]) -> Result<JsonValue> {
    let mut user = Map::new();
    user.insert("_id".into(), JsonValue::Null);
    user.insert("_version".into(), JsonValue::from(NEW_VERSION));
    for column in [
        "last_name",
        "first_name",
        "remarks",
        "login",
        "phone",
        "street",
        "postal_code",
        "town",
        "country",
    ] {
        user.insert(column.into(), row.value(column).to_json());
    }
    user.insert(
        "frontend_prefs".into(),
        parse_json_cell(row, "frontend_prefs")?.unwrap_or(JsonValue::Null),
    );
    user.insert(
        "login_disabled".into(),
        JsonValue::Bool(row.value("login_disabled").as_bool().unwrap_or(false)),
    );

    let mut js = Map::new();
    js.insert("user".into(), JsonValue::Object(user));
    js.insert(
        "_groups".into(),
        JsonValue::Array(
            group_ids
                .iter()
                .map(|id| json!({"group": {"_id": id}}))
                .collect(),
        ),
    );
    if let Some(email) = row.text("email") {
        js.insert(
            "_emails".into(),
            json!([{
                "needs_confirmation": false,
                "email": email,
                "use_for_login": true,
                "use_for_email": true,
                "send_email": false,
                "send_email_include_password": false,
                "is_primary": true,
                "intended_primary": false,
            }]),
        );
    }
    if let Some(password) = row.text("password") {
        js.insert("_password".into(), JsonValue::from(password));
    }
    Ok(JsonValue::Object(js))
}

/// Tag group with its tags, in the order the tags are given
pub fn tag_group_payload(group: &Row, tags: &[Row], languages: &[String]) -> JsonValue {
    let tags: Vec<JsonValue> = tags
        .iter()
        .map(|tag| {
            json!({
                "tag": {
                    "type": tag.value("type").to_json(),
                    "displaytype": tag.value("displaytype").to_json(),
                    "displayname": l10n_map(tag, "displayname", languages),
                    "enabled": true,
                }
            })
        })
        .collect();
    json!({
        "taggroup": {
            "type": group.value("type").to_json(),
            "displayname": l10n_map(group, "displayname", languages),
        },
        "_tags": tags,
    })
}

/// Collection row with `__parent_id` already resolved to the parent's remote id
///
/// Top-level collections go below the owner's root collection.
pub fn collection_payload(row: &Row, languages: &[String]) -> JsonValue {
    let parent = row
        .integer("__user_collection_id")
        .or_else(|| row.integer("__parent_id"));
    json!({
        "_basetype": "collection",
        "collection": {
            "_id": null,
            "_version": NEW_VERSION,
            "displayname": l10n_map(row, "displayname", languages),
            "description": l10n_map(row, "description", languages),
            "_id_parent": parent,
            "children_allowed": true,
            "type": row.value("__type").to_json(),
        },
        "_owner": {
            "_basetype": "user",
            "user": {"_id": row.value("__owner_id").to_json()},
        }
    })
}

pub fn collection_objects_payload(global_object_id: &str) -> JsonValue {
    json!({"objects": [{"_global_object_id": global_object_id}]})
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::ColumnKind;

    fn column(name: &str, column_type: ColumnType) -> EasydbColumn {
        EasydbColumn {
            name: name.into(),
            kind: ColumnKind::Column(column_type),
        }
    }

    fn languages() -> Vec<String> {
        vec!["de-DE".into(), "en-US".into()]
    }

    #[test]
    fn test_field_conversions() {
        let date = column("datum", ColumnType::Date);
        assert_eq!(
            field_value(&date, &Value::from("2020-01-01"), None).unwrap(),
            json!({"value": "2020-01-01"})
        );
        assert_eq!(field_value(&date, &Value::from(""), None).unwrap(), JsonValue::Null);

        let decimal = column("preis", ColumnType::Decimal);
        assert_eq!(field_value(&decimal, &Value::from("2.50"), None).unwrap(), json!(2.5));

        let range = column("zeitraum", ColumnType::Daterange);
        assert_eq!(
            field_value(&range, &Value::from("1900|1910"), None).unwrap(),
            json!({"from": "1900", "to": "1910"})
        );

        let flag = column("aktiv", ColumnType::Boolean);
        assert_eq!(field_value(&flag, &Value::Null, None).unwrap(), json!(false));
        assert_eq!(field_value(&flag, &Value::from(1), None).unwrap(), json!(true));

        let number = column("anzahl", ColumnType::Integer);
        assert_eq!(field_value(&number, &Value::from(""), None).unwrap(), JsonValue::Null);
        assert_eq!(field_value(&number, &Value::from("12"), None).unwrap(), json!(12));
        assert!(field_value(&number, &Value::from("zwölf"), None).is_err());
    }

    #[test]
    fn test_link_field() {
        let link = column("fotograf", ColumnType::Link);
        assert_eq!(
            field_value(&link, &Value::from(42), Some("person")).unwrap(),
            json!({"person": {"_id": 42}})
        );
        assert_eq!(field_value(&link, &Value::Null, Some("person")).unwrap(), JsonValue::Null);
        assert!(field_value(&link, &Value::from(42), None).is_err());
    }

    #[test]
    fn test_object_payload() {
        let mut ot = ObjectType::new("bilder");
        ot.pool_link = true;
        let mut object = ObjectPayload::new(&ot, "b1").with_mask(None);
        object.set_field("titel", json!({"de-DE": "Haus"}));
        object.tags = vec![3];
        object.comment = Some("migriert".into());
        assert!(object.to_json().is_err());

        object.pool_id = Some(9);
        object.parent_id = Some(2);
        assert_eq!(
            object.to_json().unwrap(),
            json!({
                "_mask": "_all_fields",
                "bilder": {
                    "_id": null,
                    "_version": 1,
                    "_id_parent": 2,
                    "_pool": {"pool": {"_id": 9}},
                    "titel": {"de-DE": "Haus"}
                },
                "_comment": "migriert",
                "_tags": [{"_id": 3}]
            })
        );
    }

    #[test]
    fn test_pool_payload_uses_root_pool() {
        let row = Row::new()
            .with("name:de-DE", "Fotos")
            .with("name:en-US", "Photos")
            .with("__parent_id", Value::Null)
            .with("_standard_masks", r#"{"bilder": "standard"}"#);
        let js = pool_payload(&row, &languages(), 1).unwrap();
        assert_eq!(js["pool"]["_id_parent"], json!(1));
        assert_eq!(js["pool"]["name"], json!({"de-DE": "Fotos", "en-US": "Photos"}));
        assert_eq!(js["_standard_masks"], json!({"bilder": "standard"}));
    }

    #[test]
    fn test_user_payload() {
        let row = Row::new()
            .with("login", "anna")
            .with("email", "anna@example.org")
            .with("frontend_prefs", r#"{"theme": "dark"}"#);
        let js = user_payload(&row, &[4, 5]).unwrap();
        assert_eq!(js["user"]["login"], json!("anna"));
        assert_eq!(js["user"]["login_disabled"], json!(false));
        assert_eq!(js["user"]["frontend_prefs"]["theme"], json!("dark"));
        assert_eq!(js["_groups"][1], json!({"group": {"_id": 5}}));
        assert_eq!(js["_emails"][0]["email"], json!("anna@example.org"));
        assert!(js.get("_password").is_none());
    }

    #[test]
    fn test_collection_payload_prefers_user_collection() {
        let row = Row::new()
            .with("displayname:de-DE", "Mappe")
            .with("__parent_id", Value::Null)
            .with("__user_collection_id", 77)
            .with("__owner_id", 7)
            .with("__type", "workfolder");
        let js = collection_payload(&row, &["de-DE".to_string()]);
        assert_eq!(js["collection"]["_id_parent"], json!(77));
        assert_eq!(js["_owner"]["user"]["_id"], json!(7));
        assert_eq!(js["collection"]["type"], json!("workfolder"));
    }

    #[test]
    fn test_tag_group_payload() {
        let group = Row::new().with("type", "checkbox").with("displayname:de-DE", "Status");
        let tags = vec![Row::new()
            .with("type", "individual")
            .with("displaytype", "facet")
            .with("displayname:de-DE", "Neu")];
        let js = tag_group_payload(&group, &tags, &["de-DE".to_string()]);
        assert_eq!(js["taggroup"]["displayname"], json!({"de-DE": "Status"}));
        assert_eq!(js["_tags"][0]["tag"]["enabled"], json!(true));
    }
}
