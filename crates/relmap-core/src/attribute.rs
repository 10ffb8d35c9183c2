//! Attribute definitions and accessor tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::record::Record;
use crate::types::DataType;
use crate::value::Value;

/// Custom getter: computes the value returned by `Record::get`.
pub type GetterFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Custom setter: receives the assigned value and writes whatever it needs
/// through `Record::set_data_value`.
pub type SetterFn = Arc<dyn Fn(&mut Record, Value) -> Result<()> + Send + Sync>;

/// Default applied to an attribute when a new record is built without it.
#[derive(Debug, Clone)]
pub enum DefaultValue {
    /// A fixed value
    Literal(Value),
    /// The current clock reading as a timestamp
    Now,
    /// Produced by a function on every build
    Generated(fn() -> Value),
}

impl DefaultValue {
    /// Resolve the default against the given clock reading (microseconds).
    pub fn resolve(&self, now: i64) -> Value {
        match self {
            DefaultValue::Literal(v) => v.clone(),
            DefaultValue::Now => Value::Timestamp(now),
            DefaultValue::Generated(f) => f(),
        }
    }
}

/// Unique-constraint membership of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unique {
    /// A single-column key named after the table and field
    Own,
    /// A composite key shared by every attribute naming the same group
    Group(String),
}

/// Metadata about one attribute of an entity.
#[derive(Clone)]
pub struct AttributeDef {
    /// Attribute name as seen by callers
    pub name: String,
    /// Storage column name (may differ from the attribute name)
    pub column: String,
    pub data_type: DataType,
    /// Whether NULL is accepted (validation raises a not-null violation otherwise)
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: Option<Unique>,
    /// Read-only attributes are ignored by non-raw writes on persisted records
    pub read_only: bool,
    pub getter: Option<GetterFn>,
    pub setter: Option<SetterFn>,
}

impl AttributeDef {
    /// Create a nullable attribute whose column has the same name.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            data_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            unique: None,
            read_only: false,
            getter: None,
            setter: None,
        }
    }

    /// Set the storage column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn not_null(self) -> Self {
        self.nullable(false)
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Literal(value.into()));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::Now);
        self
    }

    pub fn default_with(mut self, generate: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Generated(generate));
        self
    }

    /// Mark as primary key. Primary keys are never nullable.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Add a single-column unique key.
    pub fn unique(mut self) -> Self {
        self.unique = Some(Unique::Own);
        self
    }

    /// Join a composite unique key.
    pub fn unique_group(mut self, group: impl Into<String>) -> Self {
        self.unique = Some(Unique::Group(group.into()));
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&mut Record, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Whether this attribute has no backing column.
    pub fn is_virtual(&self) -> bool {
        self.data_type.is_virtual()
    }
}

impl fmt::Debug for AttributeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDef")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("data_type", &self.data_type)
            .field("nullable", &self.nullable)
            .field("default", &self.default)
            .field("primary_key", &self.primary_key)
            .field("auto_increment", &self.auto_increment)
            .field("unique", &self.unique)
            .field("read_only", &self.read_only)
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .finish()
    }
}

/// Custom accessors of one attribute.
#[derive(Clone, Default)]
pub struct Accessor {
    pub getter: Option<GetterFn>,
    pub setter: Option<SetterFn>,
}

/// Getter/setter lookup built once per schema refresh.
#[derive(Clone, Default)]
pub struct AccessorTable {
    entries: HashMap<String, Accessor>,
}

impl AccessorTable {
    /// Collect accessors from the attributes that declare any.
    pub fn from_attributes<'a>(attributes: impl IntoIterator<Item = &'a AttributeDef>) -> Self {
        let entries = attributes
            .into_iter()
            .filter(|a| a.getter.is_some() || a.setter.is_some())
            .map(|a| {
                (
                    a.name.clone(),
                    Accessor {
                        getter: a.getter.clone(),
                        setter: a.setter.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn getter(&self, name: &str) -> Option<&GetterFn> {
        self.entries.get(name).and_then(|a| a.getter.as_ref())
    }

    pub fn setter(&self, name: &str) -> Option<&SetterFn> {
        self.entries.get(name).and_then(|a| a.setter.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AccessorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("AccessorTable")
            .field("attributes", &names)
            .finish()
    }
}
