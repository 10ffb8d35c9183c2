//! Storage row representation.
//!
//! Storage backends return [`Row`]s keyed by column name. Root columns are
//! plain; columns of included entities carry their alias path as a prefix
//! (`"author.name"`, `"author.company.name"`).

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from storage.
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a row sharing column metadata with its siblings.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(names, values)
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Get a typed value by column name.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{name}' not found"),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Columns without any alias prefix.
    pub fn root(&self) -> Row {
        Row::from_pairs(
            self.iter()
                .filter(|(name, _)| !name.contains('.'))
                .map(|(name, value)| (name, value.clone())),
        )
    }

    /// Columns directly under `prefix`, with the prefix stripped.
    ///
    /// `row.scoped("author")` on `author.name`, `author.company.name` yields
    /// `name` only; nested aliases need their own full prefix.
    pub fn scoped(&self, prefix: &str) -> Row {
        let lead = format!("{prefix}.");
        Row::from_pairs(self.iter().filter_map(|(name, value)| {
            let rest = name.strip_prefix(&lead)?;
            (!rest.contains('.')).then(|| (rest.to_string(), value.clone()))
        }))
    }

    /// Whether every value is NULL, as for an unmatched outer join.
    pub fn is_all_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }
}

/// Conversion from a stored [`Value`] to a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("u64", value))?;
        u64::try_from(v).map_err(|_| {
            Error::Type(TypeError {
                expected: "u64",
                actual: format!("value {v} out of range"),
                column: None,
            })
        })
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.to_json())
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined() -> Row {
        Row::from_pairs([
            ("id", Value::BigInt(1)),
            ("title", Value::Text("Hello".into())),
            ("author.id", Value::BigInt(9)),
            ("author.name", Value::Text("Ann".into())),
            ("author.company.id", Value::Null),
        ])
    }

    #[test]
    fn typed_access() {
        let row = joined();
        assert_eq!(row.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row.get_named::<String>("title").unwrap(), "Hello");
        assert_eq!(row.get_named::<Option<i64>>("author.company.id").unwrap(), None);

        let err = row.get_named::<bool>("title").unwrap_err();
        match err {
            Error::Type(te) => assert_eq!(te.column.as_deref(), Some("title")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(row.get_named::<i64>("missing").is_err());
    }

    #[test]
    fn splits_by_prefix() {
        let row = joined();
        let root = row.root();
        assert_eq!(root.column_names().collect::<Vec<_>>(), vec!["id", "title"]);

        let author = row.scoped("author");
        assert_eq!(author.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert!(!author.is_all_null());

        let company = row.scoped("author.company");
        assert_eq!(company.len(), 1);
        assert!(company.is_all_null());
    }
}
