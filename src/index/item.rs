use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{GraphRepoError, Result};
use crate::pid::to_uri;

/// Discriminator of a processing index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Description,
    Relation,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Description => "description",
            ItemKind::Relation => "relation",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "description" => Ok(ItemKind::Description),
            "relation" => Ok(ItemKind::Relation),
            other => Err(GraphRepoError::InvalidInput(format!("Unknown index item type: {}", other))),
        }
    }
}

/// Queryable/sortable fields of the processing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexField {
    Key,
    Type,
    Source,
    Relation,
    TargetPid,
    Model,
    Title,
    Ref,
    Date,
}

impl IndexField {
    /// Column in the `processing_index` table.
    pub fn column(self) -> &'static str {
        match self {
            IndexField::Key => "item_key",
            IndexField::Type => "item_type",
            IndexField::Source => "source",
            IndexField::Relation => "relation",
            IndexField::TargetPid => "target_pid",
            IndexField::Model => "model",
            IndexField::Title => "title",
            IndexField::Ref => "ref",
            IndexField::Date => "date",
        }
    }

    /// Field name as used in rendered filter expressions.
    pub fn name(self) -> &'static str {
        match self {
            IndexField::Key => "key",
            IndexField::Type => "type",
            IndexField::Source => "source",
            IndexField::Relation => "relation",
            IndexField::TargetPid => "targetPid",
            IndexField::Model => "model",
            IndexField::Title => "title",
            IndexField::Ref => "ref",
            IndexField::Date => "date",
        }
    }

    /// True for fields fetched on every query regardless of the field list.
    pub fn always_fetched(self) -> bool {
        matches!(self, IndexField::Key | IndexField::Type | IndexField::Source)
    }
}

/// One description or relation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingIndexItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// Timestamp format whose lexical order matches time order.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GraphRepoError::InvalidInput(format!("Bad index date {}: {}", value, e)))
}

impl ProcessingIndexItem {
    pub fn description(source: &str, model: &str, title: &str, date: DateTime<Utc>) -> Self {
        Self {
            kind: ItemKind::Description,
            source: source.to_string(),
            relation: None,
            target_pid: None,
            model: Some(model.to_string()),
            title: Some(title.to_string()),
            ref_: Some(to_uri(source)),
            date: Some(date),
        }
    }

    pub fn relation(source: &str, relation: &str, target_pid: &str, date: DateTime<Utc>) -> Self {
        Self {
            kind: ItemKind::Relation,
            source: source.to_string(),
            relation: Some(relation.to_string()),
            target_pid: Some(target_pid.to_string()),
            model: None,
            title: None,
            ref_: None,
            date: Some(date),
        }
    }

    /// Unique key: `type|source[|relation|target]`.
    pub fn key(&self) -> String {
        match self.kind {
            ItemKind::Description => format!("{}|{}", self.kind.as_str(), self.source),
            ItemKind::Relation => format!(
                "{}|{}|{}|{}",
                self.kind.as_str(),
                self.source,
                self.relation.as_deref().unwrap_or_default(),
                self.target_pid.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let now = Utc::now();
        let d = ProcessingIndexItem::description("uuid:A", "monograph", "Title", now);
        assert_eq!(d.key(), "description|uuid:A");
        assert_eq!(d.ref_.as_deref(), Some("info:fedora/uuid:A"));

        let r = ProcessingIndexItem::relation("uuid:A", "hasPage", "uuid:B", now);
        assert_eq!(r.key(), "relation|uuid:A|hasPage|uuid:B");
    }

    #[test]
    fn test_date_format_roundtrip_and_order() {
        let early = parse_date("2024-01-02T03:04:05.006Z").unwrap();
        let late = parse_date("2024-01-02T03:04:05.100Z").unwrap();
        assert_eq!(format_date(&early), "2024-01-02T03:04:05.006Z");
        assert!(format_date(&early) < format_date(&late));
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let date = parse_date("2024-01-02T03:04:05.006Z").unwrap();
        let r = ProcessingIndexItem::relation("uuid:A", "hasPage", "uuid:B", date);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["type"], "relation");
        assert_eq!(json["targetPid"], "uuid:B");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn test_item_kind_parse() {
        assert_eq!(ItemKind::parse("relation").unwrap(), ItemKind::Relation);
        assert!(ItemKind::parse("other").is_err());
    }
}
