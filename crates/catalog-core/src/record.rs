//! Catalog records: tools, news articles, and the collection they belong to.
//!
//! Records are plain values. An "update" always produces a new value with the
//! same id (see [`Record::with_id`]), so snapshots can be compared and restored
//! without worrying about shared mutation.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::field_map::{FieldMap, NEWS_FIELDS, TOOL_FIELDS};

/// One of the two record collections the catalog keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Tools,
    News,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Tools, CollectionKind::News];

    /// Table name in the remote store.
    pub fn table(self) -> &'static str {
        match self {
            CollectionKind::Tools => "tools",
            CollectionKind::News => "news",
        }
    }

    /// Column the server orders by (descending, newest first).
    pub fn order_column(self) -> &'static str {
        match self {
            CollectionKind::Tools => "created_at",
            CollectionKind::News => "date",
        }
    }

    /// Name of the realtime channel carrying change notifications.
    pub fn channel_name(self) -> &'static str {
        match self {
            CollectionKind::Tools => "tools_changes",
            CollectionKind::News => "news_changes",
        }
    }

    /// Public <-> storage field name table for this kind.
    pub fn field_map(self) -> &'static FieldMap {
        match self {
            CollectionKind::Tools => &TOOL_FIELDS,
            CollectionKind::News => &NEWS_FIELDS,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            CollectionKind::Tools => 0,
            CollectionKind::News => 1,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tools" | "tool" => Ok(CollectionKind::Tools),
            "news" | "article" => Ok(CollectionKind::News),
            other => Err(format!("unknown collection: {other}")),
        }
    }
}

/// An AI tool listed in the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub price: String,
    pub image_url: String,
    pub website: String,
}

/// A news article in the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewsArticle {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub image_url: String,
    pub content: String,
    pub source: String,
    /// Publication date (RFC 3339). Assigned by the server on insert.
    pub date: String,
}

/// A record of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Tool(Tool),
    News(NewsArticle),
}

impl Record {
    pub fn kind(&self) -> CollectionKind {
        match self {
            Record::Tool(_) => CollectionKind::Tools,
            Record::News(_) => CollectionKind::News,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Tool(t) => &t.id,
            Record::News(n) => &n.id,
        }
    }

    /// Returns a copy of this record carrying `id`.
    pub fn with_id(&self, id: &str) -> Record {
        let mut next = self.clone();
        match &mut next {
            Record::Tool(t) => t.id = id.to_string(),
            Record::News(n) => n.id = id.to_string(),
        }
        next
    }

    pub fn as_tool(&self) -> Option<&Tool> {
        match self {
            Record::Tool(t) => Some(t),
            Record::News(_) => None,
        }
    }

    pub fn as_news(&self) -> Option<&NewsArticle> {
        match self {
            Record::News(n) => Some(n),
            Record::Tool(_) => None,
        }
    }
}

impl From<Tool> for Record {
    fn from(tool: Tool) -> Self {
        Record::Tool(tool)
    }
}

impl From<NewsArticle> for Record {
    fn from(article: NewsArticle) -> Self {
        Record::News(article)
    }
}

/// Typed access to one record kind.
pub trait CatalogRecord: Clone + Send + Sync + 'static {
    const KIND: CollectionKind;

    fn id(&self) -> &str;

    fn into_record(self) -> Record;

    fn from_record(record: &Record) -> Option<&Self>;
}

impl CatalogRecord for Tool {
    const KIND: CollectionKind = CollectionKind::Tools;

    fn id(&self) -> &str {
        &self.id
    }

    fn into_record(self) -> Record {
        Record::Tool(self)
    }

    fn from_record(record: &Record) -> Option<&Self> {
        record.as_tool()
    }
}

impl CatalogRecord for NewsArticle {
    const KIND: CollectionKind = CollectionKind::News;

    fn id(&self) -> &str {
        &self.id
    }

    fn into_record(self) -> Record {
        Record::News(self)
    }

    fn from_record(record: &Record) -> Option<&Self> {
        record.as_news()
    }
}

/// Role attached to a signed-in user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    /// Parses a stored role, falling back to [`Role::User`] for anything unknown.
    pub fn parse_lenient(value: Option<&str>) -> Role {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

fn lenient_role<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Role, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(Role::parse_lenient(value.as_ref().and_then(|v| v.as_str())))
}

/// Profile supplied by the identity provider for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default, deserialize_with = "lenient_role")]
    pub role: Role,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_id_leaves_original_untouched() {
        let original = Record::Tool(Tool {
            id: "a".into(),
            name: "Writer".into(),
            ..Default::default()
        });
        let renamed = original.with_id("b");

        assert_eq!(original.id(), "a");
        assert_eq!(renamed.id(), "b");
        assert_eq!(renamed.as_tool().unwrap().name, "Writer");
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("tools".parse::<CollectionKind>(), Ok(CollectionKind::Tools));
        assert_eq!(" News ".parse::<CollectionKind>(), Ok(CollectionKind::News));
        assert!("books".parse::<CollectionKind>().is_err());
        assert_eq!(CollectionKind::News.to_string(), "news");
    }

    #[test]
    fn test_tool_serializes_camel_case() {
        let tool = Tool {
            image_url: "https://img".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["imageUrl"], "https://img");
        assert!(json.get("image_url").is_none());
    }

    #[test]
    fn test_role_defaults_to_user() {
        assert_eq!(Role::parse_lenient(Some("admin")), Role::Admin);
        assert_eq!(Role::parse_lenient(Some("Admin ")), Role::Admin);
        assert_eq!(Role::parse_lenient(Some("editor")), Role::User);
        assert_eq!(Role::parse_lenient(None), Role::User);

        let profile: UserProfile =
            serde_json::from_str(r#"{"id":"u1","email":"a@b.c"}"#).unwrap();
        assert!(!profile.is_admin());
    }

    #[test]
    fn test_unreadable_role_is_user() {
        for raw in [r#""editor""#, "null", "7", r#"{"name":"admin"}"#] {
            let json = format!(r#"{{"id":"u1","email":"a@b.c","role":{raw}}}"#);
            let profile: UserProfile = serde_json::from_str(&json).unwrap();
            assert_eq!(profile.role, Role::User, "role {raw}");
        }

        let admin: UserProfile =
            serde_json::from_str(r#"{"id":"u2","email":"x@y.z","role":"Admin"}"#).unwrap();
        assert!(admin.is_admin());
    }
}
