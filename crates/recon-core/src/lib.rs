//! Core domain model for the reconciliation engine: keys, field values, records and run summaries.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod transform;

pub use error::{
    CheckpointError, DiffSide, RegistryError, RetryDisposition, StoreError, SyncError,
    TransformError,
};
pub use transform::{parse_datetime, Coercion, FieldMapping, FieldTransformSpec, TransformRegistry};

pub const CRATE_NAME: &str = "recon-core";

/// Name of a downstream entity type, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityType(&'static str);

impl EntityType {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Dependency tier. Entity types are synchronised strictly in tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTier {
    Reference,
    DerivedGroup,
    Fact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One unbounded bucket; for small reference lists.
    Direct,
    /// Aligned key-range buckets; for large fact tables.
    Bucketed,
}

/// Unique record key. Numeric keys can be bucketed, text keys only synced directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(v) => Some(*v),
            Key::Text(_) => None,
        }
    }

    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int(v) => Some(Key::Int(*v)),
            Value::Text(s) => Some(Key::Text(s.clone())),
            Value::Decimal(d) if d.fract().is_zero() => i64::try_from(*d).ok().map(Key::Int),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(v) => Value::Int(*v),
            Key::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

/// A single field value on either side of the sync.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    DateTime(DateTime<Utc>),
    TextList(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::TextList(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::DateTime(_) => "datetime",
            Value::TextList(_) => "text list",
        }
    }

    /// JSON form used by the SQL adapters: decimals and timestamps travel as strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Decimal(v) => serde_json::Value::String(v.to_string()),
            Value::Text(v) => serde_json::Value::String(v.clone()),
            Value::DateTime(v) => serde_json::Value::String(v.to_rfc3339()),
            Value::TextList(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
        }
    }

    /// Best-effort conversion from JSON. Strings stay text; coercion happens in transforms.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(*v),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Value::Int(v),
                None => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .map(Value::Decimal)
                    .unwrap_or_else(|_| Value::Text(n.to_string())),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => Value::TextList(
                items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            serde_json::Value::Object(_) => Value::Text(json.to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::TextList(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

pub type FieldMap = BTreeMap<String, Value>;

pub fn field_map_to_json(fields: &FieldMap) -> serde_json::Value {
    serde_json::Value::Object(
        fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect(),
    )
}

/// Returns `None` unless `json` is an object.
pub fn field_map_from_json(json: &serde_json::Value) -> Option<FieldMap> {
    let object = json.as_object()?;
    Some(
        object
            .iter()
            .map(|(name, value)| (name.clone(), Value::from_json(value)))
            .collect(),
    )
}

/// Anything the row-diff classifier can merge on.
pub trait Keyed {
    fn key(&self) -> &Key;
}

/// Raw upstream row. Read-only: the engine never writes it back.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRecord {
    pub key: Key,
    pub fields: FieldMap,
}

impl Keyed for UpstreamRecord {
    fn key(&self) -> &Key {
        &self.key
    }
}

/// Row in the owned downstream store.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamRow {
    pub key: Key,
    pub last_modified: Option<DateTime<Utc>>,
    pub soft_deleted: bool,
    pub fields: FieldMap,
}

impl Keyed for DownstreamRow {
    fn key(&self) -> &Key {
        &self.key
    }
}

/// Where an entity's upstream rows are read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceTable {
    pub table: String,
    pub key_field: String,
}

impl SourceTable {
    pub fn new(table: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_field: key_field.into(),
        }
    }
}

/// Physical layout of a downstream entity table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetTable {
    pub table: String,
    pub key_field: String,
    pub last_modified_field: String,
    pub deleted_field: String,
}

impl TargetTable {
    pub fn new(
        table: impl Into<String>,
        key_field: impl Into<String>,
        last_modified_field: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            key_field: key_field.into(),
            last_modified_field: last_modified_field.into(),
            deleted_field: "is_deleted".to_string(),
        }
    }
}

/// Many-to-many link table between a fact entity and member entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RelationTable {
    pub table: String,
    pub owner_field: String,
    pub member_field: String,
}

impl RelationTable {
    pub fn new(
        table: impl Into<String>,
        owner_field: impl Into<String>,
        member_field: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_field: owner_field.into(),
            member_field: member_field.into(),
        }
    }
}

/// Per-fact statistics table; rows are keyed by the fact and by the reference row counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StatisticsTable {
    pub table: String,
    pub fact_field: String,
    pub object_field: String,
}

impl StatisticsTable {
    pub fn new(
        table: impl Into<String>,
        fact_field: impl Into<String>,
        object_field: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            fact_field: fact_field.into(),
            object_field: object_field.into(),
        }
    }
}

/// Inclusive key range; `None` bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl KeyRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Text keys only fall inside an unbounded range.
    pub fn contains(&self, key: &Key) -> bool {
        match key {
            Key::Int(v) => {
                self.start.map_or(true, |s| *v >= s) && self.end.map_or(true, |e| *v <= e)
            }
            Key::Text(_) => self.is_unbounded(),
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (None, None) => f.write_str("[*]"),
            (Some(s), None) => write!(f, "[{s}-*]"),
            (None, Some(e)) => write!(f, "[*-{e}]"),
            (Some(s), Some(e)) => write!(f, "[{s}-{e}]"),
        }
    }
}

/// Per-window key statistics reported by a store for bucket planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub window: i64,
    pub min_key: i64,
    pub max_key: i64,
    pub rows: u64,
}

/// Classification of a key when comparing upstream and downstream, using CRUD naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Upstream only.
    Create,
    /// Present on both sides and unchanged.
    Read,
    /// Present on both sides, upstream is newer (or the downstream row was soft-deleted).
    Update,
    /// Downstream only.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub undeleted: u64,
}

impl BucketCounts {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0 && self.undeleted == 0
    }
}

/// Totals for one entity type over a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub undeleted: u64,
    pub buckets: u64,
}

impl SyncSummary {
    pub fn absorb(&mut self, counts: &BucketCounts) {
        self.created += counts.created;
        self.updated += counts.updated;
        self.deleted += counts.deleted;
        self.undeleted += counts.undeleted;
        self.buckets += 1;
    }

    pub fn merge(&mut self, other: &SyncSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.undeleted += other.undeleted;
        self.buckets += other.buckets;
    }

    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0 && self.undeleted == 0
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} undeleted={} buckets={}",
            self.created, self.updated, self.deleted, self.undeleted, self.buckets
        )
    }
}

/// Derived aggregate per fact row and characteristic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStatistic {
    pub fact_key: i64,
    pub characteristic: String,
    pub object_key: i64,
    pub count: u64,
    pub total: u64,
    pub ratio: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_order_numerically() {
        let mut keys = vec![Key::Int(10), Key::Int(2), Key::Int(-3)];
        keys.sort();
        assert_eq!(keys, vec![Key::Int(-3), Key::Int(2), Key::Int(10)]);
    }

    #[test]
    fn key_range_contains_is_inclusive() {
        let range = KeyRange::between(5, 9);
        assert!(range.contains(&Key::Int(5)));
        assert!(range.contains(&Key::Int(9)));
        assert!(!range.contains(&Key::Int(10)));
        assert!(!range.contains(&Key::from("a")));
        assert!(KeyRange::unbounded().contains(&Key::from("a")));
    }

    #[test]
    fn json_conversion_keeps_types_recoverable() {
        let fields = field_map_from_json(&json!({
            "id": 7,
            "salary": 1250.5,
            "tags": ["a", "b"],
            "title": "Analyst",
            "missing": null
        }))
        .expect("object");

        assert_eq!(fields["id"], Value::Int(7));
        assert_eq!(fields["salary"], Value::Decimal(Decimal::new(12505, 1)));
        assert_eq!(
            fields["tags"],
            Value::TextList(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(fields["missing"], Value::Null);

        let back = field_map_to_json(&fields);
        assert_eq!(back["salary"], json!("1250.5"));
        assert_eq!(back["title"], json!("Analyst"));
    }

    #[test]
    fn summary_absorbs_bucket_counts() {
        let mut summary = SyncSummary::default();
        summary.absorb(&BucketCounts {
            created: 3,
            updated: 1,
            deleted: 0,
            undeleted: 1,
        });
        summary.absorb(&BucketCounts::default());
        assert_eq!(summary.created, 3);
        assert_eq!(summary.buckets, 2);
        assert!(!summary.is_noop());
    }
}
