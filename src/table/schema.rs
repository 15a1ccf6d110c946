//! Versioned table schema and record validation.

use super::record::{Record, Value};
use serde::{Deserialize, Serialize};

/// Column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    UInt,
    Float,
    String,
    Bytes,
}

impl FieldType {
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::Bool, Value::Bool(_))
                | (FieldType::Int, Value::Int(_))
                | (FieldType::UInt, Value::UInt(_))
                | (FieldType::Float, Value::Float(_))
                | (FieldType::String, Value::String(_))
                | (FieldType::Bytes, Value::Bytes(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// An immutable schema version. Changes produce a new `Schema` with a
/// higher `version`; existing snapshots keep the version they were written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Schema {
            version,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            field_type,
            required: false,
        });
        self
    }

    pub fn required_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            field_type,
            required: true,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a record against this schema.
    ///
    /// Rejects unknown fields, type mismatches, and missing required fields.
    /// The error string names the first offending field.
    pub fn validate(&self, record: &Record) -> Result<(), String> {
        for (name, value) in &record.fields {
            match self.get(name) {
                None => return Err(format!("unknown field '{}'", name)),
                Some(def) if !def.field_type.accepts(value) => {
                    return Err(format!(
                        "field '{}' expects {:?}, got {}",
                        name,
                        def.field_type,
                        value.type_name()
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !record.fields.contains_key(&f.name))
        {
            return Err(format!("missing required field '{}'", missing.name));
        }
        Ok(())
    }
}
