//! Dynamic product records.
//!
//! A product is a set of namespace records keyed by namespace name; the
//! `core` namespace is always present for catalogued products. Records are
//! dynamic field maps validated against a registered [`Schema`]; typed
//! accessors cover the core fields the coordinator needs constantly.
//!
//! [`Schema`]: crate::schema::Schema

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geometry::Geometry;

/// Smallest timestamp representable in the catalogue (`0000-00-00` literal).
pub fn timestamp_min() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Largest timestamp representable in the catalogue (`9999-99-99` literal).
pub fn timestamp_max() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .unwrap()
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .unwrap()
}

/// A single field value.
///
/// `Null` is an explicit null: updating a field to `Null` clears it in the
/// catalogue, while an absent field leaves it untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Long(i64),
    Integer(i32),
    Real(f64),
    Boolean(bool),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Geometry(Geometry),
    Json(serde_json::Value),
    Sequence(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Long(_) => "long",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Boolean(_) => "boolean",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Geometry(_) => "geometry",
            Value::Json(_) => "json",
            Value::Sequence(_) => "sequence",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Long(value) => write!(f, "{}", value),
            Value::Integer(value) => write!(f, "{}", value),
            Value::Real(value) => write!(f, "{}", value),
            Value::Boolean(value) => write!(f, "{}", value),
            Value::Text(value) => f.write_str(value),
            Value::Timestamp(value) => {
                write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S%.6f"))
            }
            Value::Uuid(value) => write!(f, "{}", value),
            Value::Geometry(value) => f.write_str(&value.as_wkt()),
            Value::Json(value) => write!(f, "{}", value),
            Value::Sequence(values) => {
                let items: Vec<String> = values.iter().map(Value::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
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

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<Geometry> for Value {
    fn from(value: Geometry) -> Self {
        Value::Geometry(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// One namespace worth of fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// True when the field is present with a non-null value.
    pub fn is_defined(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(value) if !value.is_null())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Overwrite fields with those of `other`.
    pub fn update(&mut self, other: &Record) {
        for (name, value) in other.iter() {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(Value::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(Value::Long(value)) => Some(*value),
            Some(Value::Integer(value)) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(Value::Boolean(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_timestamp(&self, name: &str) -> Option<NaiveDateTime> {
        match self.fields.get(name) {
            Some(Value::Timestamp(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_uuid(&self, name: &str) -> Option<Uuid> {
        match self.fields.get(name) {
            Some(Value::Uuid(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_geometry(&self, name: &str) -> Option<&Geometry> {
        match self.fields.get(name) {
            Some(Value::Geometry(value)) => Some(value),
            _ => None,
        }
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Record {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Product properties: namespace name → record.
///
/// In an update, a namespace mapped to `None` requests deletion of that
/// namespace's row; this mirrors the distinction between "leave alone"
/// (absent) and "remove" (explicitly cleared).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    namespaces: BTreeMap<String, Option<Record>>,
}

impl Properties {
    pub fn new() -> Self {
        Properties::default()
    }

    /// Properties with an empty core record.
    pub fn with_core() -> Self {
        let mut properties = Properties::new();
        properties.set_namespace("core", Record::new());
        properties
    }

    pub fn namespace(&self, name: &str) -> Option<&Record> {
        self.namespaces.get(name).and_then(|record| record.as_ref())
    }

    pub fn namespace_mut(&mut self, name: &str) -> Option<&mut Record> {
        self.namespaces
            .get_mut(name)
            .and_then(|record| record.as_mut())
    }

    pub fn set_namespace(&mut self, name: &str, record: Record) {
        self.namespaces.insert(name.to_string(), Some(record));
    }

    /// Mark a namespace for deletion on the next catalogue update.
    pub fn clear_namespace(&mut self, name: &str) {
        self.namespaces.insert(name.to_string(), None);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        matches!(self.namespaces.get(name), Some(Some(_)))
    }

    /// All namespace entries, including cleared ones.
    pub fn entries(&self) -> impl Iterator<Item = (&String, Option<&Record>)> {
        self.namespaces
            .iter()
            .map(|(name, record)| (name, record.as_ref()))
    }

    /// Namespaces that carry a record.
    pub fn defined(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.namespaces
            .iter()
            .filter_map(|(name, record)| record.as_ref().map(|record| (name, record)))
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    pub fn core(&self) -> Result<&Record> {
        self.namespace("core")
            .ok_or_else(|| Error::Internal("product properties without core namespace".to_string()))
    }

    pub fn core_mut(&mut self) -> &mut Record {
        if !self.has_namespace("core") {
            self.set_namespace("core", Record::new());
        }
        self.namespace_mut("core").unwrap()
    }

    /// Merge `other` into these properties: namespace records merge
    /// field-wise, scalar fields replace.
    pub fn update(&mut self, other: &Properties) {
        for (name, record) in other.namespaces.iter() {
            match record {
                Some(record) => match self.namespaces.get_mut(name) {
                    Some(Some(existing)) => existing.update(record),
                    _ => {
                        self.namespaces.insert(name.clone(), Some(record.clone()));
                    }
                },
                None => {
                    self.namespaces.insert(name.clone(), None);
                }
            }
        }
    }

    // Typed core accessors. The `Result` variants are for fields the
    // lifecycle operations cannot proceed without.

    pub fn uuid(&self) -> Result<Uuid> {
        self.core()?
            .get_uuid("uuid")
            .ok_or_else(|| Error::Internal("product without core.uuid".to_string()))
    }

    pub fn active(&self) -> bool {
        self.namespace("core")
            .and_then(|core| core.get_boolean("active"))
            .unwrap_or(false)
    }

    pub fn product_type(&self) -> Result<&str> {
        self.core()?
            .get_text("product_type")
            .ok_or_else(|| Error::Internal("product without core.product_type".to_string()))
    }

    pub fn product_name(&self) -> Result<&str> {
        self.core()?
            .get_text("product_name")
            .ok_or_else(|| Error::Internal("product without core.product_name".to_string()))
    }

    pub fn physical_name(&self) -> Result<&str> {
        self.core()?
            .get_text("physical_name")
            .ok_or_else(|| Error::Internal("product without core.physical_name".to_string()))
    }

    pub fn archive_path(&self) -> Option<&str> {
        self.namespace("core")
            .and_then(|core| core.get_text("archive_path"))
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.namespace("core")
            .and_then(|core| core.get_text("remote_url"))
    }

    pub fn hash(&self) -> Option<&str> {
        self.namespace("core").and_then(|core| core.get_text("hash"))
    }

    pub fn size(&self) -> Option<i64> {
        self.namespace("core").and_then(|core| core.get_long("size"))
    }

    /// Short display form used in error messages.
    pub fn display_name(&self) -> String {
        let name = self
            .namespace("core")
            .and_then(|core| core.get_text("product_name"))
            .unwrap_or("?");
        let uuid = self
            .namespace("core")
            .and_then(|core| core.get_uuid("uuid"))
            .map(|uuid| uuid.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!("'{}' ({})", name, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with(name: &str, value: impl Into<Value>) -> Properties {
        let mut properties = Properties::with_core();
        properties.core_mut().set(name, value);
        properties
    }

    #[test]
    fn update_merges_namespace_records() {
        let mut properties = core_with("product_name", "a");
        properties.core_mut().set("size", 10i64);

        let update = core_with("product_name", "b");
        properties.update(&update);

        let core = properties.core().unwrap();
        assert_eq!(core.get_text("product_name"), Some("b"));
        assert_eq!(core.get_long("size"), Some(10));
    }

    #[test]
    fn cleared_namespace_survives_merge() {
        let mut properties = Properties::with_core();
        properties.set_namespace("extra", Record::new());

        let mut update = Properties::new();
        update.clear_namespace("extra");
        properties.update(&update);

        assert!(!properties.has_namespace("extra"));
        assert!(properties.entries().any(|(name, record)| name == "extra" && record.is_none()));
    }

    #[test]
    fn null_value_is_present_but_not_defined() {
        let mut record = Record::new();
        record.set("hash", Value::Null);
        assert!(record.contains("hash"));
        assert!(!record.is_defined("hash"));
    }

    #[test]
    fn timestamp_extremes() {
        assert!(timestamp_min() < timestamp_max());
        assert_eq!(timestamp_max().format("%Y").to_string(), "9999");
    }
}
