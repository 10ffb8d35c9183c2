//! Attribute data types.

use crate::value::Value;

/// Data types an attribute can declare.
///
/// The type drives the derived field lists of a schema (boolean, date, JSON,
/// range, virtual) and the sanitizing applied when a value is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    // Integer types
    Integer,
    BigInt,

    // Floating point
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    String(u32),
    Text,

    // Binary
    Blob,

    // Date/time types
    Date,
    DateTime,

    // UUID
    Uuid,

    // JSON documents (dotted-path assignment applies to these)
    Json,
    JsonB,

    // Range of an inner type
    Range(Box<DataType>),

    // Arrays
    Array(Box<DataType>),

    // Computed attribute with no backing column
    Virtual(Box<DataType>),
}

impl DataType {
    /// Get the type name used in diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            DataType::Integer => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Double => "DOUBLE PRECISION".to_string(),
            DataType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::String(len) => format!("VARCHAR({})", len),
            DataType::Text => "TEXT".to_string(),
            DataType::Blob => "BLOB".to_string(),
            DataType::Date => "DATEONLY".to_string(),
            DataType::DateTime => "DATE".to_string(),
            DataType::Uuid => "UUID".to_string(),
            DataType::Json => "JSON".to_string(),
            DataType::JsonB => "JSONB".to_string(),
            DataType::Range(inner) => format!("RANGE({})", inner.type_name()),
            DataType::Array(inner) => format!("{}[]", inner.type_name()),
            DataType::Virtual(inner) => format!("VIRTUAL({})", inner.type_name()),
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::BigInt | DataType::Double | DataType::Decimal { .. }
        )
    }

    pub const fn is_boolean(&self) -> bool {
        matches!(self, DataType::Boolean)
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::DateTime)
    }

    pub const fn is_json(&self) -> bool {
        matches!(self, DataType::Json | DataType::JsonB)
    }

    pub const fn is_range(&self) -> bool {
        matches!(self, DataType::Range(_))
    }

    pub const fn is_virtual(&self) -> bool {
        matches!(self, DataType::Virtual(_))
    }

    /// Normalize an assigned value to the representation this type stores.
    ///
    /// Booleans accept 0/1 and "true"/"false"; integers are widened to
    /// `BigInt` so equality-based change detection is width-independent.
    pub fn sanitize(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (DataType::Boolean, Value::Int(v)) => Value::Bool(v != 0),
            (DataType::Boolean, Value::BigInt(v)) => Value::Bool(v != 0),
            (DataType::Boolean, Value::Text(s)) => match s.as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => Value::Text(s),
            },
            (DataType::Integer | DataType::BigInt, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (DataType::Double, Value::Int(v)) => Value::Double(f64::from(v)),
            (DataType::Double, Value::BigInt(v)) => Value::Double(v as f64),
            (DataType::Virtual(inner), value) => inner.sanitize(value),
            (_, value) => value,
        }
    }
}
