//! Translation between in-memory records and storage rows.
//!
//! The store uses snake_case column names for some fields while records use
//! camelCase. Each kind has one explicit table of renamed fields; every other
//! field passes through untouched.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::{CollectionKind, NewsArticle, Record, Tool};

#[derive(Debug, Error)]
pub enum FieldMapError {
    #[error("Row is not a JSON object")]
    NotAnObject,

    #[error("Failed to encode record: {0}")]
    Encode(String),

    #[error("Failed to decode {kind} row: {message}")]
    Decode {
        kind: CollectionKind,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, FieldMapError>;

/// A JSON row in storage representation.
pub type Row = Map<String, Value>;

/// Columns the server owns; never sent on update.
pub const SERVER_OWNED: [&str; 2] = ["id", "created_at"];

/// Bidirectional (public name, storage name) table.
#[derive(Debug)]
pub struct FieldMap {
    pairs: &'static [(&'static str, &'static str)],
}

pub static TOOL_FIELDS: FieldMap = FieldMap {
    pairs: &[("imageUrl", "image_url")],
};

pub static NEWS_FIELDS: FieldMap = FieldMap {
    pairs: &[("imageUrl", "image_url")],
};

impl FieldMap {
    pub fn pairs(&self) -> &'static [(&'static str, &'static str)] {
        self.pairs
    }

    /// Storage name for a public field.
    pub fn storage_name<'a>(&self, public: &'a str) -> &'a str {
        self.pairs
            .iter()
            .find(|(p, _)| *p == public)
            .map(|(_, s)| *s)
            .unwrap_or(public)
    }

    /// Rename public keys to storage keys in place.
    fn to_storage(&self, row: &mut Row) {
        for (public, storage) in self.pairs {
            if let Some(value) = row.remove(*public) {
                row.insert((*storage).to_string(), value);
            }
        }
    }

    /// Rename storage keys to public keys in place.
    ///
    /// A missing, null, or empty storage value falls back to the public key
    /// (rows written by older clients), then to an empty string.
    fn to_public(&self, row: &mut Row) {
        for (public, storage) in self.pairs {
            let stored = row.remove(*storage).filter(|v| !is_blank(v));
            let value = stored
                .or_else(|| row.remove(*public).filter(|v| !is_blank(v)))
                .unwrap_or_else(|| Value::String(String::new()));
            row.insert((*public).to_string(), value);
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Encode a record as a storage row.
pub fn to_row(record: &Record) -> Result<Row> {
    let value = match record {
        Record::Tool(t) => serde_json::to_value(t),
        Record::News(n) => serde_json::to_value(n),
    }
    .map_err(|e| FieldMapError::Encode(e.to_string()))?;

    let Value::Object(mut row) = value else {
        return Err(FieldMapError::NotAnObject);
    };
    record.kind().field_map().to_storage(&mut row);
    Ok(row)
}

/// Decode a storage row into a record of `kind`.
pub fn from_row(kind: CollectionKind, value: Value) -> Result<Record> {
    let Value::Object(mut row) = value else {
        return Err(FieldMapError::NotAnObject);
    };
    kind.field_map().to_public(&mut row);

    let decode_err = |e: serde_json::Error| FieldMapError::Decode {
        kind,
        message: e.to_string(),
    };
    let value = Value::Object(row);
    match kind {
        CollectionKind::Tools => serde_json::from_value::<Tool>(value)
            .map(Record::Tool)
            .map_err(decode_err),
        CollectionKind::News => serde_json::from_value::<NewsArticle>(value)
            .map(Record::News)
            .map_err(decode_err),
    }
}

/// Row sent on insert. The id is stripped so the server assigns one; news
/// gets its publication date from `now`.
pub fn insert_row(record: &Record, now: &str) -> Result<Row> {
    let mut row = to_row(record)?;
    row.remove("id");
    if record.kind() == CollectionKind::News {
        row.insert("date".to_string(), Value::String(now.to_string()));
    }
    Ok(row)
}

/// Row sent on update, without server-owned columns.
pub fn update_row(record: &Record) -> Result<Row> {
    let mut row = to_row(record)?;
    for column in SERVER_OWNED {
        row.remove(column);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool() -> Record {
        Record::Tool(Tool {
            id: "t-1".into(),
            name: "Scribe".into(),
            description: "Writes things".into(),
            category: "Writing".into(),
            tags: vec!["text".into(), "llm".into()],
            price: "Free".into(),
            image_url: "https://cdn/scribe.png".into(),
            website: "https://scribe.ai".into(),
        })
    }

    #[test]
    fn test_to_row_renames_image_url() {
        let row = to_row(&sample_tool()).unwrap();
        assert_eq!(row["image_url"], "https://cdn/scribe.png");
        assert!(!row.contains_key("imageUrl"));
        assert_eq!(row["tags"], json!(["text", "llm"]));
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let news = Record::News(NewsArticle {
            id: "n-1".into(),
            title: "Launch".into(),
            image_url: "https://cdn/n.png".into(),
            date: "2025-01-01T00:00:00Z".into(),
            ..Default::default()
        });
        for record in [sample_tool(), news] {
            let row = to_row(&record).unwrap();
            let back = from_row(record.kind(), Value::Object(row)).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_from_row_falls_back_to_public_name() {
        let row = json!({"id": "t-2", "name": "Old", "image_url": null, "imageUrl": "https://legacy"});
        let record = from_row(CollectionKind::Tools, row).unwrap();
        assert_eq!(record.as_tool().unwrap().image_url, "https://legacy");

        let row = json!({"id": "t-3", "name": "Bare"});
        let record = from_row(CollectionKind::Tools, row).unwrap();
        assert_eq!(record.as_tool().unwrap().image_url, "");
    }

    #[test]
    fn test_from_row_ignores_storage_only_columns() {
        let row = json!({"id": "t-4", "name": "X", "created_at": "2025-02-02T00:00:00Z"});
        let record = from_row(CollectionKind::Tools, row).unwrap();
        assert_eq!(record.id(), "t-4");
    }

    #[test]
    fn test_insert_row_strips_id_and_stamps_news_date() {
        let row = insert_row(&sample_tool(), "2025-03-03T00:00:00Z").unwrap();
        assert!(!row.contains_key("id"));
        assert!(!row.contains_key("date"));

        let news = Record::News(NewsArticle {
            id: "client-side".into(),
            date: "stale".into(),
            ..Default::default()
        });
        let row = insert_row(&news, "2025-03-03T00:00:00Z").unwrap();
        assert!(!row.contains_key("id"));
        assert_eq!(row["date"], "2025-03-03T00:00:00Z");
    }

    #[test]
    fn test_update_row_strips_server_owned() {
        let row = update_row(&sample_tool()).unwrap();
        assert!(!row.contains_key("id"));
        assert!(!row.contains_key("created_at"));
        assert_eq!(row["name"], "Scribe");
    }

    #[test]
    fn test_from_row_rejects_non_object() {
        assert!(matches!(
            from_row(CollectionKind::News, json!([1, 2])),
            Err(FieldMapError::NotAnObject)
        ));
    }
}
