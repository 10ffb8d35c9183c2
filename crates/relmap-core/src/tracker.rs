//! Change tracking and dirty detection for records.
//!
//! Every record carries a [`ChangeTracker`] holding its current values, the
//! snapshot taken at the last load or save, and the set of attributes whose
//! current value differs from that snapshot.

use std::collections::{HashMap, HashSet};

use crate::value::Value;

/// Current values, last-persisted snapshot and dirty set of one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeTracker {
    current: HashMap<String, Value>,
    previous: HashMap<String, Value>,
    dirty: HashSet<String>,
}

impl ChangeTracker {
    /// Create a new empty change tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether assigning `new` over a snapshot holding `old` is a change.
    ///
    /// Non-null embedded documents always count as changed; scalars compare
    /// by equality, and an absent snapshot differs from everything.
    pub fn value_changed(new: &Value, old: Option<&Value>) -> bool {
        (!new.is_primitive() && !new.is_null()) || old != Some(new)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.current.get(name)
    }

    pub fn previous(&self, name: &str) -> Option<&Value> {
        self.previous.get(name)
    }

    pub fn current(&self) -> &HashMap<String, Value> {
        &self.current
    }

    pub fn previous_values(&self) -> &HashMap<String, Value> {
        &self.previous
    }

    /// Tracked write: updates the value and re-derives the dirty flag.
    /// Returns whether the attribute is dirty afterwards.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub fn write(&mut self, name: &str, value: Value) -> bool {
        let dirty = Self::value_changed(&value, self.previous.get(name));
        self.current.insert(name.to_string(), value);
        self.set_dirty(name, dirty);
        tracing::trace!(field = name, dirty, "tracked write");
        dirty
    }

    /// Raw write: value and snapshot both take the new value, nothing is dirty.
    pub fn write_raw(&mut self, name: &str, value: Value) {
        self.previous.insert(name.to_string(), value.clone());
        self.current.insert(name.to_string(), value);
        self.dirty.remove(name);
    }

    /// Untracked write: only the current value changes.
    pub fn assign(&mut self, name: &str, value: Value) {
        self.current.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.dirty.remove(name);
        self.previous.remove(name);
        self.current.remove(name)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn set_dirty(&mut self, name: &str, dirty: bool) {
        if dirty {
            self.dirty.insert(name.to_string());
        } else {
            self.dirty.remove(name);
        }
    }

    /// Re-derive the dirty flag of one attribute from its current value.
    pub fn recheck(&mut self, name: &str) {
        if let Some(current) = self.current.get(name) {
            let dirty = Self::value_changed(current, self.previous.get(name));
            self.set_dirty(name, dirty);
        }
    }

    /// Snapshot the given attributes and clear their dirty flags.
    pub fn commit<S: AsRef<str>>(&mut self, fields: &[S]) {
        for field in fields {
            let field = field.as_ref();
            match self.current.get(field) {
                Some(value) => {
                    self.previous.insert(field.to_string(), value.clone());
                }
                None => {
                    self.previous.remove(field);
                }
            }
            self.dirty.remove(field);
        }
    }

    /// Snapshot everything and clear all dirty flags.
    pub fn commit_all(&mut self) {
        self.previous = self.current.clone();
        self.dirty.clear();
    }
}
