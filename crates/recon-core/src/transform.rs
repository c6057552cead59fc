//! Declarative field transforms from upstream record shapes to downstream entity shapes.
//!
//! Each entity type registers one [`FieldTransformSpec`]. Transforms are pure: the same raw
//! record always yields the same downstream field map, so a failed bucket can be retried safely.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, TransformError};
use crate::{EntityType, FieldMap, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coercion {
    Identity,
    Integer,
    Text,
    Boolean,
    DateTime,
    Decimal,
    /// Splits a delimited text value into a trimmed list, dropping empty items.
    SplitList { separator: char },
    /// Takes the first item of a list value.
    FirstOfList,
}

impl Coercion {
    pub fn name(&self) -> &'static str {
        match self {
            Coercion::Identity => "identity",
            Coercion::Integer => "integer",
            Coercion::Text => "text",
            Coercion::Boolean => "boolean",
            Coercion::DateTime => "datetime",
            Coercion::Decimal => "decimal",
            Coercion::SplitList { .. } => "split list",
            Coercion::FirstOfList => "first of list",
        }
    }

    fn blank_is_null(&self) -> bool {
        matches!(
            self,
            Coercion::Integer | Coercion::Boolean | Coercion::DateTime | Coercion::Decimal
        )
    }

    pub fn apply(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (Coercion::Identity, v) => Ok(v.clone()),
            (_, Value::Null) => Ok(Value::Null),

            (Coercion::Integer, Value::Int(v)) => Ok(Value::Int(*v)),
            (Coercion::Integer, Value::Decimal(d)) if d.fract().is_zero() => i64::try_from(*d)
                .map(Value::Int)
                .map_err(|_| format!("{d} does not fit in i64")),
            (Coercion::Integer, Value::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|err| format!("`{s}`: {err}")),

            (Coercion::Text, Value::Text(s)) => Ok(Value::Text(s.clone())),
            (Coercion::Text, Value::Int(v)) => Ok(Value::Text(v.to_string())),
            (Coercion::Text, Value::Decimal(d)) => Ok(Value::Text(d.to_string())),
            (Coercion::Text, Value::Bool(b)) => Ok(Value::Text(b.to_string())),
            (Coercion::Text, Value::DateTime(dt)) => Ok(Value::Text(dt.to_rfc3339())),

            (Coercion::Boolean, Value::Bool(b)) => Ok(Value::Bool(*b)),
            (Coercion::Boolean, Value::Int(0)) => Ok(Value::Bool(false)),
            (Coercion::Boolean, Value::Int(1)) => Ok(Value::Bool(true)),
            (Coercion::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("`{s}` is not a boolean")),
            },

            (Coercion::DateTime, Value::DateTime(dt)) => Ok(Value::DateTime(*dt)),
            (Coercion::DateTime, Value::Text(s)) => parse_datetime(s)
                .map(Value::DateTime)
                .ok_or_else(|| format!("`{s}` is not a timestamp")),

            (Coercion::Decimal, Value::Decimal(d)) => Ok(Value::Decimal(*d)),
            (Coercion::Decimal, Value::Int(v)) => Ok(Value::Decimal(Decimal::from(*v))),
            (Coercion::Decimal, Value::Text(s)) => parse_decimal(s).map(Value::Decimal),

            (Coercion::SplitList { separator }, Value::Text(s)) => Ok(Value::TextList(
                s.split(*separator)
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            (Coercion::SplitList { .. }, Value::TextList(items)) => Ok(Value::TextList(
                items
                    .iter()
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            )),

            (Coercion::FirstOfList, Value::TextList(items)) => Ok(items
                .first()
                .map(|first| Value::Text(first.clone()))
                .unwrap_or(Value::Null)),
            (Coercion::FirstOfList, Value::Text(s)) => Ok(Value::Text(s.clone())),

            (coercion, other) => Err(format!(
                "{} value cannot become {}",
                other.type_name(),
                coercion.name()
            )),
        }
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let trimmed = raw.trim();
    if trimmed.contains(',') || trimmed.contains('_') {
        return Err(format!("`{raw}` contains a digit separator"));
    }
    Decimal::from_str(trimmed).map_err(|err| format!("`{raw}`: {err}"))
}

/// Parses RFC 3339 or naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` timestamps; naive values are UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub target: String,
    pub source: String,
    pub coercion: Coercion,
    #[serde(default = "default_required")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldTransformSpec {
    pub entity: EntityType,
    pub version: u32,
    pub key_field: String,
    pub last_modified_field: String,
    pub mappings: Vec<FieldMapping>,
}

impl FieldTransformSpec {
    pub fn new(entity: EntityType, version: u32) -> Self {
        Self {
            entity,
            version,
            key_field: String::new(),
            last_modified_field: String::new(),
            mappings: Vec::new(),
        }
    }

    /// Integer key mapping.
    pub fn key(self, target: &str, source: &str) -> Self {
        self.key_with(target, source, Coercion::Integer)
    }

    pub fn key_with(mut self, target: &str, source: &str, coercion: Coercion) -> Self {
        self.key_field = target.to_string();
        self.push(target, source, coercion, true)
    }

    pub fn last_modified(mut self, target: &str, source: &str) -> Self {
        self.last_modified_field = target.to_string();
        self.push(target, source, Coercion::DateTime, true)
    }

    pub fn required(self, target: &str, source: &str, coercion: Coercion) -> Self {
        self.push(target, source, coercion, true)
    }

    pub fn optional(self, target: &str, source: &str, coercion: Coercion) -> Self {
        self.push(target, source, coercion, false)
    }

    fn push(mut self, target: &str, source: &str, coercion: Coercion, required: bool) -> Self {
        self.mappings.push(FieldMapping {
            target: target.to_string(),
            source: source.to_string(),
            coercion,
            required,
        });
        self
    }

    pub fn mapping(&self, target: &str) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.target == target)
    }

    /// One mapped field coerced on its own; `None` when the mapping, the value or the coercion
    /// is missing.
    pub fn coerce_field(&self, target: &str, raw: &FieldMap) -> Option<Value> {
        let mapping = self.mapping(target)?;
        let value = raw.get(&mapping.source).filter(|v| !v.is_null())?;
        mapping.coercion.apply(value).ok()
    }

    /// Downstream fields written on update, i.e. everything except the key.
    pub fn update_fields(&self) -> Vec<String> {
        self.mappings
            .iter()
            .filter(|m| m.target != self.key_field)
            .map(|m| m.target.clone())
            .collect()
    }

    /// Stable hash of the mapping; checkpoints written under another fingerprint are discarded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.entity.as_str().as_bytes());
        hasher.update(self.version.to_be_bytes());
        hasher.update(self.key_field.as_bytes());
        hasher.update(self.last_modified_field.as_bytes());
        for mapping in &self.mappings {
            hasher.update([0u8]);
            hasher.update(mapping.target.as_bytes());
            hasher.update([0u8]);
            hasher.update(mapping.source.as_bytes());
            hasher.update([0u8]);
            hasher.update(mapping.coercion.name().as_bytes());
            if let Coercion::SplitList { separator } = mapping.coercion {
                hasher.update(separator.to_string().as_bytes());
            }
            hasher.update([mapping.required as u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = BTreeSet::new();
        for mapping in &self.mappings {
            if !seen.insert(mapping.target.as_str()) {
                return Err(RegistryError::DuplicateTarget {
                    entity: self.entity,
                    field: mapping.target.clone(),
                });
            }
        }
        for field in [&self.key_field, &self.last_modified_field] {
            let present = self
                .mapping(field)
                .map(|m| m.required)
                .unwrap_or(false);
            if !present {
                return Err(RegistryError::MissingRequired {
                    entity: self.entity,
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn apply(&self, raw: &FieldMap) -> Result<FieldMap, TransformError> {
        let mut out = FieldMap::new();
        for mapping in &self.mappings {
            let value = raw.get(&mapping.source).unwrap_or(&Value::Null);
            let blank = matches!(value, Value::Text(s) if s.trim().is_empty());
            let coerced = if value.is_null() || (blank && !mapping.required && mapping.coercion.blank_is_null()) {
                Value::Null
            } else {
                mapping
                    .coercion
                    .apply(value)
                    .map_err(|reason| TransformError::Coercion {
                        entity: self.entity,
                        field: mapping.target.clone(),
                        source_field: mapping.source.clone(),
                        coercion: mapping.coercion.name(),
                        reason,
                    })?
            };
            if coerced.is_null() && mapping.required {
                return Err(TransformError::MissingField {
                    entity: self.entity,
                    field: mapping.target.clone(),
                    source_field: mapping.source.clone(),
                });
            }
            out.insert(mapping.target.clone(), coerced);
        }
        Ok(out)
    }
}

/// Transform specs keyed by entity type.
#[derive(Debug, Default, Clone)]
pub struct TransformRegistry {
    specs: HashMap<EntityType, Arc<FieldTransformSpec>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: FieldTransformSpec) -> Result<(), RegistryError> {
        if self.specs.contains_key(&spec.entity) {
            return Err(RegistryError::Duplicate(spec.entity));
        }
        spec.validate()?;
        self.specs.insert(spec.entity, Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, entity: EntityType) -> Result<Arc<FieldTransformSpec>, TransformError> {
        self.specs
            .get(&entity)
            .cloned()
            .ok_or(TransformError::Unregistered(entity))
    }

    pub fn transform(&self, entity: EntityType, raw: &FieldMap) -> Result<FieldMap, TransformError> {
        self.get(entity)?.apply(raw)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
