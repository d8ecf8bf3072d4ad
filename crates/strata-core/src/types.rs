//! Field type tags and the conversions they drive.
//!
//! A [`FieldType`] decides three things: whether the field owns a column,
//! how a raw column value read back from the database becomes a [`Value`]
//! variant, and how user input is normalized before it is written.

use crate::error::{Error, Result, TypeError};
use crate::value::{Value, parse_date, parse_datetime};
use serde::{Deserialize, Serialize};

/// Type tag of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Selection,
    Binary,
    Json,
    Many2One,
    One2One,
    One2Many,
    Many2Many,
    Rev2One,
}

impl FieldType {
    /// Human readable name, as used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Char => "char",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Selection => "selection",
            FieldType::Binary => "binary",
            FieldType::Json => "json",
            FieldType::Many2One => "many2one",
            FieldType::One2One => "one2one",
            FieldType::One2Many => "one2many",
            FieldType::Many2Many => "many2many",
            FieldType::Rev2One => "rev2one",
        }
    }

    /// Whether the field points at records of another model.
    pub const fn is_relation(self) -> bool {
        matches!(
            self,
            FieldType::Many2One
                | FieldType::One2One
                | FieldType::One2Many
                | FieldType::Many2Many
                | FieldType::Rev2One
        )
    }

    /// Whether the relation is stored as a foreign key column on this model.
    pub const fn is_fk(self) -> bool {
        matches!(self, FieldType::Many2One | FieldType::One2One)
    }

    /// Whether the relation is the reverse side of a foreign key on the target.
    pub const fn is_reverse(self) -> bool {
        matches!(self, FieldType::One2Many | FieldType::Rev2One)
    }

    /// Whether the field holds a set of records rather than one.
    pub const fn is_x2many(self) -> bool {
        matches!(self, FieldType::One2Many | FieldType::Many2Many)
    }

    /// Whether values of this type live in a column of the model's table.
    pub const fn has_column(self) -> bool {
        !matches!(
            self,
            FieldType::One2Many | FieldType::Many2Many | FieldType::Rev2One
        )
    }

    /// Whether the field can be aggregated in grouped reads.
    pub const fn is_numeric(self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }

    /// Convert a raw column value, as returned by a driver, to its
    /// in-memory variant. This conversion is total: unparsable input is
    /// kept as-is and logged.
    pub fn from_column(self, raw: Value) -> Value {
        match (self, raw) {
            (FieldType::Boolean, Value::Null) => Value::Bool(false),
            (FieldType::Boolean, Value::Integer(n)) => Value::Bool(n != 0),
            (_, Value::Null) if self.is_x2many() => Value::Refs(Vec::new()),
            (_, Value::Null) => Value::Null,
            (FieldType::Float, Value::Integer(n)) => Value::Float(n as f64),
            (FieldType::Date, Value::Text(s)) => match parse_date(&s) {
                Some(days) => Value::Date(days),
                None => lossy(self, Value::Text(s)),
            },
            (FieldType::DateTime, Value::Text(s)) => match parse_datetime(&s) {
                Some(ts) => Value::DateTime(ts),
                None => lossy(self, Value::Text(s)),
            },
            (FieldType::Json, Value::Text(s)) => match serde_json::from_str(&s) {
                Ok(json) => Value::Json(json),
                Err(_) => lossy(self, Value::Text(s)),
            },
            (FieldType::Binary, Value::Text(s)) => Value::Bytes(s.into_bytes()),
            (FieldType::Char | FieldType::Text | FieldType::Selection, Value::Integer(n)) => {
                Value::Text(n.to_string())
            }
            (FieldType::Many2One | FieldType::One2One | FieldType::Rev2One, Value::Integer(id)) => {
                if id > 0 { Value::Ref(id) } else { Value::Null }
            }
            (_, raw) => raw,
        }
    }

    /// Convert an in-memory value to the value bound as a statement parameter.
    pub fn to_column(self, value: &Value) -> Value {
        match (self, value) {
            (FieldType::Many2One | FieldType::One2One, v) => {
                v.as_id().map_or(Value::Null, Value::Integer)
            }
            (FieldType::Json, Value::Map(_) | Value::Array(_)) => Value::Json(value.to_json()),
            (_, v) => v.clone(),
        }
    }

    /// Normalize user input for a field of this type.
    pub fn coerce(self, value: Value) -> Result<Value> {
        let coerced = match (self, value) {
            (FieldType::One2Many | FieldType::Many2Many, v) => match v.as_ids() {
                Some(ids) => Value::Refs(ids),
                None => return Err(type_mismatch(self, &v)),
            },
            (_, Value::Null) => Value::Null,
            (FieldType::Char | FieldType::Text | FieldType::Selection, Value::Text(s)) => {
                Value::Text(s)
            }
            (FieldType::Integer, Value::Integer(n)) => Value::Integer(n),
            (FieldType::Integer, Value::Bool(b)) => Value::Integer(i64::from(b)),
            (FieldType::Integer, Value::Float(f)) if f.fract() == 0.0 => Value::Integer(f as i64),
            (FieldType::Float, Value::Float(f)) => Value::Float(f),
            (FieldType::Float, Value::Integer(n)) => Value::Float(n as f64),
            (FieldType::Boolean, Value::Bool(b)) => Value::Bool(b),
            (FieldType::Boolean, Value::Integer(n)) => Value::Bool(n != 0),
            (FieldType::Date, Value::Date(d)) => Value::Date(d),
            (FieldType::Date, Value::DateTime(ts)) => {
                Value::Date(ts.div_euclid(86_400_000_000) as i32)
            }
            (FieldType::Date, Value::Text(s)) => match parse_date(&s) {
                Some(d) => Value::Date(d),
                None => return Err(type_mismatch(self, &Value::Text(s))),
            },
            (FieldType::DateTime, Value::DateTime(ts)) => Value::DateTime(ts),
            (FieldType::DateTime, Value::Date(d)) => {
                Value::DateTime(i64::from(d) * 86_400_000_000)
            }
            (FieldType::DateTime, Value::Text(s)) => match parse_datetime(&s) {
                Some(ts) => Value::DateTime(ts),
                None => return Err(type_mismatch(self, &Value::Text(s))),
            },
            (FieldType::Binary, Value::Bytes(b)) => Value::Bytes(b),
            (FieldType::Binary, Value::Text(s)) => Value::Bytes(s.into_bytes()),
            (FieldType::Json, Value::Json(j)) => Value::Json(j),
            (FieldType::Json, v @ (Value::Map(_) | Value::Array(_) | Value::Text(_))) => {
                Value::Json(v.to_json())
            }
            (FieldType::Many2One | FieldType::One2One | FieldType::Rev2One, v) => {
                match v.as_ids() {
                    Some(ids) if ids.is_empty() => Value::Null,
                    Some(ids) if ids.len() == 1 => Value::Ref(ids[0]),
                    _ => return Err(type_mismatch(self, &v)),
                }
            }
            (_, v) => return Err(type_mismatch(self, &v)),
        };
        Ok(coerced)
    }
}

fn lossy(field_type: FieldType, raw: Value) -> Value {
    tracing::warn!(
        field_type = field_type.name(),
        value = %raw,
        "Column value could not be converted; keeping raw value"
    );
    raw
}

fn type_mismatch(field_type: FieldType, value: &Value) -> Error {
    Error::Type(TypeError {
        expected: field_type.name(),
        actual: value.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}
