//! Records: attribute values of one entity instance plus change tracking.
//!
//! A [`Record`] is built either as a new, unsaved instance (defaults
//! applied, writes tracked) or loaded from storage (raw writes, nothing
//! dirty). Related records loaded through includes hang off the record by
//! association alias.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::association::Association;
use crate::error::Result;
use crate::predicate::Where;
use crate::row::Row;
use crate::schema::Schema;
use crate::tracker::ChangeTracker;
use crate::value::Value;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// An include attached to a record: assignments to `alias` build related
/// records of `schema` instead of writing an attribute.
#[derive(Debug, Clone)]
pub struct AttachedInclude {
    pub alias: String,
    pub association: Arc<Association>,
    pub schema: Arc<Schema>,
    pub include: Vec<AttachedInclude>,
}

/// Related records attached under one alias.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Related {
    /// Related records as a flat list.
    pub fn records(&self) -> Vec<&Record> {
        match self {
            Related::One(Some(r)) => vec![r.as_ref()],
            Related::One(None) => Vec::new(),
            Related::Many(rs) => rs.iter().collect(),
        }
    }

    pub fn records_mut(&mut self) -> Vec<&mut Record> {
        match self {
            Related::One(Some(r)) => vec![r.as_mut()],
            Related::One(None) => Vec::new(),
            Related::Many(rs) => rs.iter_mut().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Related::One(r) => usize::from(r.is_some()),
            Related::Many(rs) => rs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Options for [`Record::build`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// A new record gets defaults and is inserted on save
    pub is_new: bool,
    /// Write values raw: no setters, no guards, nothing dirty
    pub raw: bool,
    pub include: Vec<AttachedInclude>,
    /// Clock reading used for `Now` defaults
    pub now: Option<i64>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            is_new: true,
            raw: false,
            include: Vec::new(),
            now: None,
        }
    }
}

impl BuildOptions {
    pub fn include(mut self, include: Vec<AttachedInclude>) -> Self {
        self.include = include;
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn now(mut self, now: i64) -> Self {
        self.now = Some(now);
        self
    }
}

/// Options for [`Record::set_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub raw: bool,
}

impl SetOptions {
    pub const RAW: SetOptions = SetOptions { raw: true };
}

/// Saved tracker state, used to undo a failed save.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    tracker: ChangeTracker,
    is_new: bool,
}

/// One entity instance.
#[derive(Clone)]
pub struct Record {
    schema: Arc<Schema>,
    tracker: ChangeTracker,
    is_new: bool,
    include: Vec<AttachedInclude>,
    related: HashMap<String, Related>,
}

impl Record {
    /// Build a record from (attribute, value) pairs.
    pub fn build<I, K, V>(schema: &Arc<Schema>, values: I, options: BuildOptions) -> Result<Record>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let values: Vec<(String, Value)> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut record = Record {
            schema: Arc::clone(schema),
            tracker: ChangeTracker::new(),
            is_new: options.is_new,
            include: options.include,
            related: HashMap::new(),
        };

        if options.is_new {
            let now = options.now.unwrap_or_else(now_micros);
            let given = |name: &str| values.iter().any(|(k, _)| k == name);
            for pk in schema.primary_keys() {
                if !given(pk) {
                    record.tracker.write_raw(pk, Value::Null);
                }
            }
            for attr in schema.attributes() {
                if given(&attr.name) {
                    continue;
                }
                if let Some(default) = &attr.default {
                    let value = attr.data_type.sanitize(default.resolve(now));
                    record.tracker.write_raw(&attr.name, value);
                }
            }
        }

        let set_options = SetOptions { raw: options.raw };
        for (name, value) in values {
            record.set_with(&name, value, set_options)?;
        }
        Ok(record)
    }

    /// Materialize a persisted record: raw values, nothing dirty.
    pub fn load<I, K, V>(schema: &Arc<Schema>, values: I, include: Vec<AttachedInclude>) -> Result<Record>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let options = BuildOptions {
            is_new: false,
            raw: true,
            include,
            now: None,
        };
        Self::build(schema, values, options)
    }

    /// Materialize a persisted record from a storage row keyed by column.
    pub fn from_row(schema: &Arc<Schema>, row: &Row) -> Result<Record> {
        let values: Vec<(String, Value)> = row
            .iter()
            .map(|(column, value)| (schema.field_of(column).to_string(), value.clone()))
            .collect();
        Self::load(schema, values, Vec::new())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn entity(&self) -> &str {
        self.schema.name()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Flip to persisted after a successful insert.
    pub fn mark_persisted(&mut self) {
        self.is_new = false;
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Value as seen by callers: custom getters apply.
    pub fn get(&self, name: &str) -> Value {
        if let Some(getter) = self.schema.accessors().getter(name) {
            return getter(self);
        }
        self.tracker.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Stored value, bypassing getters.
    pub fn get_data_value(&self, name: &str) -> Option<&Value> {
        self.tracker.get(name)
    }

    /// Stored values of all attributes in schema order.
    pub fn data_values(&self) -> Vec<(String, Value)> {
        self.schema
            .attributes()
            .iter()
            .filter_map(|a| {
                self.tracker
                    .get(&a.name)
                    .map(|v| (a.name.clone(), v.clone()))
            })
            .collect()
    }

    /// Assign through setters and guards.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_with(name, value.into(), SetOptions::default())
    }

    /// Assign several values in order.
    pub fn set_all<I, K, V>(&mut self, values: I, options: SetOptions) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (name, value) in values {
            self.set_with(name.as_ref(), value.into(), options)?;
        }
        Ok(())
    }

    /// Assign one value.
    ///
    /// Non-raw writes run the custom setter if there is one, route include
    /// aliases to related records, ignore unknown attributes (dotted paths
    /// into JSON attributes excepted), refuse to overwrite a set primary key
    /// and ignore read-only attributes of persisted records. Raw writes skip
    /// all of that and resync the snapshot so nothing becomes dirty.
    pub fn set_with(&mut self, name: &str, value: Value, options: SetOptions) -> Result<()> {
        if !options.raw {
            if let Some(setter) = self.schema.accessors().setter(name).cloned() {
                setter(self, value)?;
                self.tracker.recheck(name);
                return Ok(());
            }
        }

        if let Some(pos) = self.include.iter().position(|i| i.alias == name) {
            return self.set_include(pos, value, options);
        }

        if !options.raw {
            if !self.schema.has_attribute(name) {
                if let Some((head, path)) = name.split_once('.') {
                    if self.schema.is_json(head) {
                        self.set_json_path(head, path, &value);
                        return Ok(());
                    }
                }
                tracing::trace!(entity = %self.entity(), field = name, "ignoring unknown attribute");
                return Ok(());
            }
            if self.schema.is_primary_key(name)
                && self.tracker.get(name).is_some_and(|v| !v.is_null())
            {
                tracing::warn!(
                    entity = %self.entity(),
                    field = name,
                    "primary key is already set; ignoring assignment"
                );
                return Ok(());
            }
            if !self.is_new && self.schema.is_read_only(name) {
                tracing::debug!(
                    entity = %self.entity(),
                    field = name,
                    "read-only attribute; ignoring assignment"
                );
                return Ok(());
            }
        }

        let value = match self.schema.attribute(name) {
            Some(attr) => attr.data_type.sanitize(value),
            None => value,
        };
        if options.raw {
            self.tracker.write_raw(name, value);
        } else {
            self.tracker.write(name, value);
        }
        Ok(())
    }

    /// Tracked write with no setter or guard, for use inside custom setters.
    pub fn set_data_value(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let value = match self.schema.attribute(name) {
            Some(attr) => attr.data_type.sanitize(value),
            None => value,
        };
        self.tracker.write(name, value);
    }

    /// Untracked write: the value changes, dirty flags and snapshot do not.
    pub fn assign(&mut self, name: &str, value: Value) {
        self.tracker.assign(name, value);
    }

    fn set_json_path(&mut self, head: &str, path: &str, value: &Value) {
        let mut doc = match self.tracker.get(head) {
            Some(Value::Json(doc)) if doc.is_object() => doc.clone(),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };
        let new_leaf = value.to_json();
        let segments: Vec<&str> = path.split('.').collect();
        let mut cursor = &mut doc;
        for (i, segment) in segments.iter().enumerate() {
            if !cursor.is_object() {
                *cursor = serde_json::Value::Object(serde_json::Map::new());
            }
            let serde_json::Value::Object(map) = cursor else {
                return;
            };
            if i + 1 == segments.len() {
                if map.get(*segment) == Some(&new_leaf) {
                    return;
                }
                map.insert((*segment).to_string(), new_leaf);
                break;
            }
            cursor = map
                .entry((*segment).to_string())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        }
        self.tracker.write(head, Value::Json(doc));
    }

    fn set_include(&mut self, pos: usize, value: Value, options: SetOptions) -> Result<()> {
        let include = self.include[pos].clone();
        let child_options = || BuildOptions {
            is_new: self.is_new,
            raw: options.raw,
            include: include.include.clone(),
            now: None,
        };
        let build_child = |doc: &serde_json::Value| -> Result<Option<Record>> {
            match doc {
                serde_json::Value::Object(map) => {
                    let values = map.iter().map(|(k, v)| (k.clone(), Value::from_json(v)));
                    Record::build(&include.schema, values, child_options()).map(Some)
                }
                _ => Ok(None),
            }
        };
        let docs: Vec<serde_json::Value> = match value {
            Value::Null => Vec::new(),
            Value::Json(serde_json::Value::Array(items)) => items,
            Value::Json(doc) => vec![doc],
            Value::Array(items) => items.iter().map(Value::to_json).collect(),
            other => {
                tracing::warn!(
                    entity = %self.entity(),
                    alias = %include.alias,
                    value_type = other.type_name(),
                    "include assignment needs a document; ignoring"
                );
                return Ok(());
            }
        };
        let mut children = Vec::with_capacity(docs.len());
        for doc in &docs {
            if let Some(child) = build_child(doc)? {
                children.push(child);
            }
        }
        let related = if include.association.is_single_valued() {
            Related::One(children.into_iter().next().map(Box::new))
        } else {
            Related::Many(children)
        };
        self.related.insert(include.alias, related);
        Ok(())
    }

    /// Declared attributes whose value differs from the last snapshot, in
    /// schema order.
    pub fn changed(&self) -> Vec<String> {
        self.schema
            .attributes()
            .iter()
            .filter(|a| self.tracker.is_dirty(&a.name))
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn is_changed(&self, name: &str) -> bool {
        self.tracker.is_dirty(name)
    }

    pub fn has_changes(&self) -> bool {
        self.schema
            .attributes()
            .iter()
            .any(|a| self.tracker.is_dirty(&a.name))
    }

    /// Force or clear the dirty flag of one attribute.
    pub fn changed_field(&mut self, name: &str, changed: bool) {
        self.tracker.set_dirty(name, changed);
    }

    /// Value at the last load or save.
    pub fn previous(&self, name: &str) -> Option<&Value> {
        self.tracker.previous(name)
    }

    /// Snapshot the given attributes and clear their dirty flags.
    pub fn commit<S: AsRef<str>>(&mut self, fields: &[S]) {
        self.tracker.commit(fields);
    }

    pub fn commit_all(&mut self) {
        self.tracker.commit_all();
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tracker: self.tracker.clone(),
            is_new: self.is_new,
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.tracker = checkpoint.tracker;
        self.is_new = checkpoint.is_new;
    }

    /// Whether the deletion timestamp differs from its default.
    pub fn is_soft_deleted(&self) -> bool {
        let Some(field) = self.schema.deleted_at() else {
            return false;
        };
        let default = self
            .schema
            .default_for(field)
            .map_or(Value::Null, |d| d.resolve(0));
        self.tracker.get(field).is_some_and(|v| *v != default)
    }

    pub fn primary_key_values(&self) -> Vec<(String, Value)> {
        self.schema
            .primary_keys()
            .iter()
            .map(|k| (k.clone(), self.tracker.get(k).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Stable key of the primary key values, `None` while any is NULL.
    pub fn identity_key(&self) -> Option<String> {
        let values: Vec<Value> = self
            .primary_key_values()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        if values.iter().any(Value::is_null) {
            return None;
        }
        serde_json::to_string(&values).ok()
    }

    /// Predicate selecting this record's row, optionally pinned to the
    /// version it was read at.
    pub fn where_identity(&self, check_version: bool) -> Where {
        let mut parts: Vec<Where> = self
            .primary_key_values()
            .into_iter()
            .map(|(k, v)| Where::eq(k, v))
            .collect();
        if check_version {
            if let Some(version) = self.schema.version_field() {
                let current = self.tracker.get(version).cloned().unwrap_or(Value::Null);
                parts.push(Where::eq(version, current));
            }
        }
        Where::And(parts)
    }

    pub fn include(&self) -> &[AttachedInclude] {
        &self.include
    }

    pub fn set_include_tree(&mut self, include: Vec<AttachedInclude>) {
        self.include = include;
    }

    pub fn related(&self, alias: &str) -> Option<&Related> {
        self.related.get(alias)
    }

    pub fn related_mut(&mut self, alias: &str) -> Option<&mut Related> {
        self.related.get_mut(alias)
    }

    pub fn set_related(&mut self, alias: impl Into<String>, related: Related) {
        self.related.insert(alias.into(), related);
    }

    pub fn take_related(&mut self, alias: &str) -> Option<Related> {
        self.related.remove(alias)
    }

    pub fn related_aliases(&self) -> impl Iterator<Item = &str> {
        self.related.keys().map(String::as_str)
    }

    /// Plain JSON view: getter-aware attribute values plus related records.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for attr in self.schema.attributes() {
            if self.tracker.get(&attr.name).is_some()
                || self.schema.accessors().getter(&attr.name).is_some()
            {
                map.insert(attr.name.clone(), self.get(&attr.name).to_json());
            }
        }
        let mut aliases: Vec<&String> = self.related.keys().collect();
        aliases.sort();
        for alias in aliases {
            let json = match &self.related[alias] {
                Related::One(Some(r)) => r.to_json(),
                Related::One(None) => serde_json::Value::Null,
                Related::Many(rs) => serde_json::Value::Array(rs.iter().map(Record::to_json).collect()),
            };
            map.insert(alias.clone(), json);
        }
        serde_json::Value::Object(map)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("entity", &self.schema.name())
            .field("is_new", &self.is_new)
            .field("values", &self.data_values())
            .field("changed", &self.changed())
            .field("related", &self.related)
            .finish()
    }
}
