//! Namespace schemas.
//!
//! A schema is an ordered mapping from field identifiers to typed field
//! definitions. The `core` schema is built in; extension namespaces are
//! registered through the namespace plugin API.

use std::path::Path;

use crate::error::{Error, Result};
use crate::records::{Record, Value};

/// The closed set of field types supported by the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Long,
    Integer,
    Real,
    Boolean,
    Text,
    Timestamp,
    Uuid,
    Geometry,
    Json,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Long => "long",
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Boolean => "boolean",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Uuid => "uuid",
            DataType::Geometry => "geometry",
            DataType::Json => "json",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Extra validation applied on top of the base type of a text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldConstraint {
    /// Relative path inside the store; absolute paths and `..` are rejected.
    ArchivePath,
    /// Basename on storage; path separators are rejected.
    Basename,
}

/// Definition of a single schema field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub optional: bool,
    pub index: bool,
    pub constraint: Option<FieldConstraint>,
}

impl Field {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Field {
            name: name.to_string(),
            data_type,
            optional: false,
            index: false,
            constraint: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn constrained(mut self, constraint: FieldConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

/// An ordered namespace schema. Field order determines catalogue column
/// order, so it is preserved as declared.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a record against this schema.
    ///
    /// With `partial` set, missing mandatory fields are accepted; this is the
    /// mode used for catalogue updates and for decoding partial selections.
    pub fn validate(&self, namespace: &str, record: &Record, partial: bool) -> Result<()> {
        let mut validated = 0;
        for field in &self.fields {
            match record.get(&field.name) {
                None => {
                    if !partial && !field.optional {
                        return Err(Error::User(format!(
                            "{}.{}: no value for mandatory item",
                            namespace, field.name
                        )));
                    }
                }
                Some(value) => {
                    if !(field.optional && value.is_null()) {
                        validate_value(value, field).map_err(|message| {
                            Error::User(format!("{}.{}: {}", namespace, field.name, message))
                        })?;
                    }
                    validated += 1;
                }
            }
        }

        if validated != record.len() {
            let extra = record
                .iter()
                .map(|(name, _)| name)
                .find(|name| !self.contains(name))
                .cloned()
                .unwrap_or_default();
            return Err(Error::User(format!(
                "{}: undefined item: \"{}\"",
                namespace, extra
            )));
        }

        Ok(())
    }
}

impl FromIterator<Field> for Schema {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Schema {
            fields: iter.into_iter().collect(),
        }
    }
}

fn validate_value(value: &Value, field: &Field) -> std::result::Result<(), String> {
    let mismatch = || {
        format!(
            "invalid value of type \"{}\" for type \"{}\"",
            value.type_name(),
            field.data_type
        )
    };

    match field.data_type {
        DataType::Long => match value {
            Value::Long(_) | Value::Integer(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Integer => match value {
            Value::Integer(_) => Ok(()),
            Value::Long(inner)
                if *inner >= i32::MIN as i64 && *inner <= i32::MAX as i64 =>
            {
                Ok(())
            }
            _ => Err(mismatch()),
        },
        DataType::Real => match value {
            Value::Real(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Boolean => match value {
            Value::Boolean(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Text => match value {
            Value::Text(text) => validate_text_constraint(text, field.constraint),
            _ => Err(mismatch()),
        },
        DataType::Timestamp => match value {
            Value::Timestamp(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Uuid => match value {
            Value::Uuid(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Geometry => match value {
            Value::Geometry(_) => Ok(()),
            _ => Err(mismatch()),
        },
        DataType::Json => match value {
            Value::Json(json) if json.is_object() => Ok(()),
            _ => Err(mismatch()),
        },
    }
}

fn validate_text_constraint(
    text: &str,
    constraint: Option<FieldConstraint>,
) -> std::result::Result<(), String> {
    match constraint {
        None => Ok(()),
        Some(FieldConstraint::ArchivePath) => {
            let path = Path::new(text);
            if path.is_absolute()
                || path
                    .components()
                    .any(|component| component == std::path::Component::ParentDir)
            {
                Err(format!("invalid value \"{}\" for an archive path", text))
            } else {
                Ok(())
            }
        }
        Some(FieldConstraint::Basename) => {
            if Path::new(text).file_name().map(|name| name == text) == Some(true) {
                Ok(())
            } else {
                Err(format!("invalid value \"{}\" for a basename", text))
            }
        }
    }
}

/// Schema of the mandatory `core` namespace.
pub fn core_schema() -> Schema {
    Schema::new()
        .with_field(Field::new("uuid", DataType::Uuid))
        .with_field(Field::new("active", DataType::Boolean).indexed())
        .with_field(Field::new("hash", DataType::Text).optional().indexed())
        .with_field(Field::new("size", DataType::Long).optional().indexed())
        .with_field(Field::new("metadata_date", DataType::Timestamp).indexed())
        .with_field(Field::new("archive_date", DataType::Timestamp).optional().indexed())
        .with_field(
            Field::new("archive_path", DataType::Text)
                .optional()
                .constrained(FieldConstraint::ArchivePath),
        )
        .with_field(Field::new("product_type", DataType::Text).indexed())
        .with_field(Field::new("product_name", DataType::Text).indexed())
        .with_field(
            Field::new("physical_name", DataType::Text)
                .indexed()
                .constrained(FieldConstraint::Basename),
        )
        .with_field(Field::new("validity_start", DataType::Timestamp).optional().indexed())
        .with_field(Field::new("validity_stop", DataType::Timestamp).optional().indexed())
        .with_field(Field::new("creation_date", DataType::Timestamp).optional().indexed())
        .with_field(Field::new("footprint", DataType::Geometry).optional().indexed())
        .with_field(Field::new("remote_url", DataType::Text).optional())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Record;

    fn sample_schema() -> Schema {
        Schema::new()
            .with_field(Field::new("name", DataType::Text))
            .with_field(Field::new("count", DataType::Long).optional())
    }

    #[test]
    fn missing_mandatory_field_is_rejected() {
        let mut record = Record::new();
        record.set("count", 1i64);

        let err = sample_schema().validate("ns", &record, false).unwrap_err();
        assert!(err.to_string().contains("ns.name"));

        sample_schema().validate("ns", &record, true).unwrap();
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut record = Record::new();
        record.set("name", "x");
        record.set("bogus", 1i64);

        let err = sample_schema().validate("ns", &record, false).unwrap_err();
        assert!(err.to_string().contains("undefined item"));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut record = Record::new();
        record.set("name", 42i64);

        assert!(sample_schema().validate("ns", &record, false).is_err());
    }

    #[test]
    fn null_clears_optional_but_not_mandatory() {
        let mut record = Record::new();
        record.set("name", Value::Null);
        assert!(sample_schema().validate("ns", &record, true).is_err());

        let mut record = Record::new();
        record.set("name", "x");
        record.set("count", Value::Null);
        sample_schema().validate("ns", &record, false).unwrap();
    }

    #[test]
    fn archive_path_rejects_escapes() {
        let schema = core_schema();
        let mut record = Record::new();
        record.set("archive_path", "../evil");
        assert!(schema.validate("core", &record, true).is_err());

        let mut record = Record::new();
        record.set("archive_path", "/abs/path");
        assert!(schema.validate("core", &record, true).is_err());

        let mut record = Record::new();
        record.set("archive_path", "a/b/c");
        schema.validate("core", &record, true).unwrap();
    }

    #[test]
    fn physical_name_must_be_a_basename() {
        let schema = core_schema();
        let mut record = Record::new();
        record.set("physical_name", "dir/file.txt");
        assert!(schema.validate("core", &record, true).is_err());
    }
}
