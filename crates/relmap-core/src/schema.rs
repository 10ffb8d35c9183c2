//! Entity schemas.
//!
//! A [`Schema`] owns the declared attributes of one entity together with
//! everything derived from them: the synthesized primary key and timestamp
//! attributes, per-type field lists, unique keys, the field/column maps and
//! the accessor table. All derived state is rebuilt from scratch by
//! [`Schema::refresh`] whenever the declared attributes change.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::association::Association;
use crate::attribute::{AccessorTable, AttributeDef, DefaultValue, Unique};
use crate::error::{Error, Result, SchemaErrorKind};
use crate::options::Scope;
use crate::types::DataType;

/// Entity-level options.
#[derive(Debug, Clone)]
pub struct SchemaOptions {
    /// Storage table; defaults to the entity name
    pub table_name: Option<String>,
    /// Maintain creation/update timestamps
    pub timestamps: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// Soft deletion: destroy sets a deletion timestamp instead of removing
    pub paranoid: bool,
    pub deleted_at: String,
    /// Optimistic-lock version attribute
    pub version: Option<String>,
    /// Name of the synthesized primary key
    pub primary_key: String,
    pub default_scope: Option<Scope>,
    pub scopes: Vec<(String, Scope)>,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            table_name: None,
            timestamps: true,
            created_at: Some("created_at".to_string()),
            updated_at: Some("updated_at".to_string()),
            paranoid: false,
            deleted_at: "deleted_at".to_string(),
            version: None,
            primary_key: "id".to_string(),
            default_scope: None,
            scopes: Vec::new(),
        }
    }
}

impl SchemaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn created_at(mut self, name: Option<&str>) -> Self {
        self.created_at = name.map(str::to_string);
        self
    }

    pub fn updated_at(mut self, name: Option<&str>) -> Self {
        self.updated_at = name.map(str::to_string);
        self
    }

    pub fn paranoid(mut self, enabled: bool) -> Self {
        self.paranoid = enabled;
        self
    }

    pub fn deleted_at(mut self, name: impl Into<String>) -> Self {
        self.deleted_at = name.into();
        self
    }

    /// Enable optimistic locking on the `version` attribute.
    pub fn versioned(mut self) -> Self {
        self.version = Some("version".to_string());
        self
    }

    pub fn version(mut self, name: impl Into<String>) -> Self {
        self.version = Some(name.into());
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = name.into();
        self
    }

    pub fn default_scope(mut self, scope: Scope) -> Self {
        self.default_scope = Some(scope);
        self
    }

    pub fn scope(mut self, name: impl Into<String>, scope: Scope) -> Self {
        self.scopes.push((name.into(), scope));
        self
    }
}

/// A unique key over one or more attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub name: String,
    pub fields: Vec<String>,
}

/// Runtime description of one entity.
#[derive(Clone)]
pub struct Schema {
    name: String,
    table: String,
    options: SchemaOptions,
    declared: Vec<AttributeDef>,

    // derived by refresh()
    attributes: Vec<AttributeDef>,
    index: HashMap<String, usize>,
    primary_keys: Vec<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    deleted_at: Option<String>,
    version: Option<String>,
    boolean_fields: Vec<String>,
    date_fields: Vec<String>,
    json_fields: Vec<String>,
    range_fields: Vec<String>,
    virtual_fields: Vec<String>,
    read_only: HashSet<String>,
    unique_keys: Vec<UniqueKey>,
    field_to_column: HashMap<String, String>,
    column_to_field: HashMap<String, String>,
    defaults: HashMap<String, DefaultValue>,
    accessors: AccessorTable,

    associations: Vec<Arc<Association>>,
}

impl Schema {
    /// Register an entity from its declared attributes.
    pub fn register(
        name: impl Into<String>,
        attributes: Vec<AttributeDef>,
        options: SchemaOptions,
    ) -> Result<Schema> {
        let name = name.into();
        let mut seen = HashSet::new();
        for attr in &attributes {
            if !seen.insert(attr.name.as_str()) {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateField,
                    format!("{name}: attribute '{}' is declared twice", attr.name),
                ));
            }
        }
        let table = options.table_name.clone().unwrap_or_else(|| name.clone());
        let mut schema = Schema {
            name,
            table,
            options,
            declared: attributes,
            attributes: Vec::new(),
            index: HashMap::new(),
            primary_keys: Vec::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            version: None,
            boolean_fields: Vec::new(),
            date_fields: Vec::new(),
            json_fields: Vec::new(),
            range_fields: Vec::new(),
            virtual_fields: Vec::new(),
            read_only: HashSet::new(),
            unique_keys: Vec::new(),
            field_to_column: HashMap::new(),
            column_to_field: HashMap::new(),
            defaults: HashMap::new(),
            accessors: AccessorTable::default(),
            associations: Vec::new(),
        };
        schema.refresh()?;
        tracing::debug!(
            entity = %schema.name,
            table = %schema.table,
            attributes = schema.attributes.len(),
            "registered schema"
        );
        Ok(schema)
    }

    /// Rebuild every derived index from the declared attributes.
    pub fn refresh(&mut self) -> Result<()> {
        let mut attributes = self.declared.clone();

        if !attributes.iter().any(|a| a.primary_key) {
            let pk = self.options.primary_key.clone();
            if attributes.iter().any(|a| a.name == pk) {
                return Err(Error::schema(
                    SchemaErrorKind::PrimaryKeyConflict,
                    format!(
                        "{}: a column called '{pk}' was added but no primary key was defined; \
                         mark it as primary key or rename it",
                        self.name
                    ),
                ));
            }
            attributes.insert(
                0,
                AttributeDef::new(pk, DataType::Integer)
                    .primary_key()
                    .auto_increment()
                    .read_only(),
            );
        }

        let tail = |attributes: &mut Vec<AttributeDef>, def: AttributeDef| {
            if let Some(existing) = attributes.iter_mut().find(|a| a.name == def.name) {
                existing.read_only = true;
            } else {
                attributes.push(def);
            }
        };

        self.created_at = None;
        self.updated_at = None;
        if self.options.timestamps {
            if let Some(name) = self.options.created_at.clone() {
                tail(
                    &mut attributes,
                    AttributeDef::new(name.clone(), DataType::DateTime)
                        .not_null()
                        .read_only(),
                );
                self.created_at = Some(name);
            }
            if let Some(name) = self.options.updated_at.clone() {
                tail(
                    &mut attributes,
                    AttributeDef::new(name.clone(), DataType::DateTime)
                        .not_null()
                        .read_only(),
                );
                self.updated_at = Some(name);
            }
        }
        self.deleted_at = None;
        if self.options.paranoid {
            let name = self.options.deleted_at.clone();
            tail(
                &mut attributes,
                AttributeDef::new(name.clone(), DataType::DateTime).read_only(),
            );
            self.deleted_at = Some(name);
        }
        self.version = None;
        if let Some(name) = self.options.version.clone() {
            tail(
                &mut attributes,
                AttributeDef::new(name.clone(), DataType::Integer)
                    .not_null()
                    .default_value(0_i64)
                    .read_only(),
            );
            self.version = Some(name);
        }

        self.index = attributes
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        self.primary_keys = attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.name.clone())
            .collect();

        let names_where = |pred: fn(&DataType) -> bool| -> Vec<String> {
            attributes
                .iter()
                .filter(|a| pred(&a.data_type))
                .map(|a| a.name.clone())
                .collect()
        };
        self.boolean_fields = names_where(DataType::is_boolean);
        self.date_fields = names_where(DataType::is_temporal);
        self.json_fields = names_where(DataType::is_json);
        self.range_fields = names_where(DataType::is_range);
        self.virtual_fields = names_where(DataType::is_virtual);

        self.read_only = attributes
            .iter()
            .filter(|a| a.read_only)
            .map(|a| a.name.clone())
            .collect();

        self.unique_keys.clear();
        for attr in &attributes {
            let key_name = match &attr.unique {
                Some(Unique::Own) => format!("{}_{}_unique", self.table, attr.column),
                Some(Unique::Group(group)) => group.clone(),
                None => continue,
            };
            match self.unique_keys.iter_mut().find(|k| k.name == key_name) {
                Some(key) => key.fields.push(attr.name.clone()),
                None => self.unique_keys.push(UniqueKey {
                    name: key_name,
                    fields: vec![attr.name.clone()],
                }),
            }
        }

        self.field_to_column.clear();
        self.column_to_field.clear();
        for attr in attributes.iter().filter(|a| a.name != a.column) {
            self.field_to_column
                .insert(attr.name.clone(), attr.column.clone());
            self.column_to_field
                .insert(attr.column.clone(), attr.name.clone());
        }

        self.defaults = attributes
            .iter()
            .filter_map(|a| a.default.clone().map(|d| (a.name.clone(), d)))
            .collect();
        self.accessors = AccessorTable::from_attributes(&attributes);
        self.attributes = attributes;

        tracing::trace!(
            entity = %self.name,
            attributes = self.attributes.len(),
            unique_keys = self.unique_keys.len(),
            "schema refreshed"
        );
        Ok(())
    }

    /// Declare another attribute and rebuild derived state.
    pub fn add_field(&mut self, attribute: AttributeDef) -> Result<()> {
        if self.declared.iter().any(|a| a.name == attribute.name) {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateField,
                format!("{}: attribute '{}' already exists", self.name, attribute.name),
            ));
        }
        self.declared.push(attribute);
        if let Err(e) = self.refresh() {
            self.declared.pop();
            self.refresh()?;
            return Err(e);
        }
        Ok(())
    }

    /// Remove a declared attribute and rebuild derived state.
    pub fn remove_field(&mut self, name: &str) -> Result<AttributeDef> {
        let Some(pos) = self.declared.iter().position(|a| a.name == name) else {
            return Err(Error::schema(
                SchemaErrorKind::UnknownField,
                format!("{}: no declared attribute '{name}'", self.name),
            ));
        };
        let removed = self.declared.remove(pos);
        if let Err(e) = self.refresh() {
            self.declared.insert(pos, removed);
            self.refresh()?;
            return Err(e);
        }
        Ok(removed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    /// Attributes in declaration order, synthesized primary key first and
    /// synthesized timestamp/version attributes last.
    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.index.get(name).map(|&i| &self.attributes[i])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }

    /// Attributes backed by a storage column.
    pub fn persisted_fields(&self) -> Vec<String> {
        self.attributes
            .iter()
            .filter(|a| !a.is_virtual())
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    /// The first primary key attribute.
    pub fn primary_key(&self) -> &str {
        self.primary_keys
            .first()
            .map_or(self.options.primary_key.as_str(), String::as_str)
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_keys.iter().any(|k| k == name)
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.read_only.contains(name)
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtual_fields.iter().any(|f| f == name)
    }

    pub fn is_json(&self, name: &str) -> bool {
        self.json_fields.iter().any(|f| f == name)
    }

    pub fn is_boolean(&self, name: &str) -> bool {
        self.boolean_fields.iter().any(|f| f == name)
    }

    pub fn boolean_fields(&self) -> &[String] {
        &self.boolean_fields
    }

    pub fn date_fields(&self) -> &[String] {
        &self.date_fields
    }

    pub fn json_fields(&self) -> &[String] {
        &self.json_fields
    }

    pub fn range_fields(&self) -> &[String] {
        &self.range_fields
    }

    pub fn virtual_fields(&self) -> &[String] {
        &self.virtual_fields
    }

    pub fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }

    pub fn deleted_at(&self) -> Option<&str> {
        self.deleted_at.as_deref()
    }

    pub fn is_paranoid(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn version_field(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn unique_keys(&self) -> &[UniqueKey] {
        &self.unique_keys
    }

    /// Storage column of an attribute. Unknown names pass through unchanged.
    pub fn column_of<'a>(&'a self, field: &'a str) -> &'a str {
        self.field_to_column
            .get(field)
            .map_or(field, String::as_str)
    }

    /// Attribute of a storage column. Unknown columns pass through unchanged.
    pub fn field_of<'a>(&'a self, column: &'a str) -> &'a str {
        self.column_to_field
            .get(column)
            .map_or(column, String::as_str)
    }

    pub fn default_for(&self, name: &str) -> Option<&DefaultValue> {
        self.defaults.get(name)
    }

    pub fn defaults(&self) -> &HashMap<String, DefaultValue> {
        &self.defaults
    }

    pub fn accessors(&self) -> &AccessorTable {
        &self.accessors
    }

    pub fn associations(&self) -> &[Arc<Association>] {
        &self.associations
    }

    pub fn association(&self, alias: &str) -> Option<&Arc<Association>> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    /// All associations whose target is `target`.
    pub fn associations_to(&self, target: &str) -> Vec<&Arc<Association>> {
        self.associations
            .iter()
            .filter(|a| a.target == target)
            .collect()
    }

    pub(crate) fn push_association(&mut self, association: Arc<Association>) {
        self.associations.push(association);
    }

    pub fn default_scope(&self) -> Option<&Scope> {
        self.options.default_scope.as_ref()
    }

    pub fn named_scope(&self, name: &str) -> Option<&Scope> {
        self.options
            .scopes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("attributes", &self.attributes)
            .field("primary_keys", &self.primary_keys)
            .field("unique_keys", &self.unique_keys)
            .field("associations", &self.associations.len())
            .finish_non_exhaustive()
    }
}
