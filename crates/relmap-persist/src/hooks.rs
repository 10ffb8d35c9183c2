//! Lifecycle hooks.
//!
//! Hooks are synchronous callbacks registered per entity and lifecycle
//! point. They receive mutable access to whatever the point is about (a
//! record, find options, a plan, bulk values) and may abort the operation
//! by returning an error.

use std::collections::HashMap;
use std::fmt;

use relmap_core::{Error, FindOptions, Record, Result, Value, Where};
use relmap_query::{NormalizedFind, QueryPlan};
use serde::{Deserialize, Serialize};

/// Points in the lifecycle where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    BeforeValidate,
    AfterValidate,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeSave,
    AfterSave,
    BeforeDestroy,
    AfterDestroy,
    BeforeRestore,
    AfterRestore,
    BeforeBulkCreate,
    AfterBulkCreate,
    BeforeBulkUpdate,
    AfterBulkUpdate,
    BeforeBulkDestroy,
    AfterBulkDestroy,
    BeforeBulkRestore,
    AfterBulkRestore,
    /// Raw find options, before scopes and include expansion
    BeforeFind,
    /// Normalized options with scope and expanded includes
    BeforeFindAfterExpandIncludeAll,
    /// The validated plan, before it reaches storage
    BeforeFindAfterOptions,
    AfterFind,
    BeforeCount,
}

impl HookPoint {
    pub const fn as_str(self) -> &'static str {
        match self {
            HookPoint::BeforeValidate => "beforeValidate",
            HookPoint::AfterValidate => "afterValidate",
            HookPoint::BeforeCreate => "beforeCreate",
            HookPoint::AfterCreate => "afterCreate",
            HookPoint::BeforeUpdate => "beforeUpdate",
            HookPoint::AfterUpdate => "afterUpdate",
            HookPoint::BeforeSave => "beforeSave",
            HookPoint::AfterSave => "afterSave",
            HookPoint::BeforeDestroy => "beforeDestroy",
            HookPoint::AfterDestroy => "afterDestroy",
            HookPoint::BeforeRestore => "beforeRestore",
            HookPoint::AfterRestore => "afterRestore",
            HookPoint::BeforeBulkCreate => "beforeBulkCreate",
            HookPoint::AfterBulkCreate => "afterBulkCreate",
            HookPoint::BeforeBulkUpdate => "beforeBulkUpdate",
            HookPoint::AfterBulkUpdate => "afterBulkUpdate",
            HookPoint::BeforeBulkDestroy => "beforeBulkDestroy",
            HookPoint::AfterBulkDestroy => "afterBulkDestroy",
            HookPoint::BeforeBulkRestore => "beforeBulkRestore",
            HookPoint::AfterBulkRestore => "afterBulkRestore",
            HookPoint::BeforeFind => "beforeFind",
            HookPoint::BeforeFindAfterExpandIncludeAll => "beforeFindAfterExpandIncludeAll",
            HookPoint::BeforeFindAfterOptions => "beforeFindAfterOptions",
            HookPoint::AfterFind => "afterFind",
            HookPoint::BeforeCount => "beforeCount",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook gets to see and change.
pub enum HookArgs<'a> {
    Record(&'a mut Record),
    Records(&'a mut Vec<Record>),
    Find(&'a mut FindOptions),
    Normalized(&'a mut NormalizedFind),
    Plan(&'a mut QueryPlan),
    Bulk {
        values: &'a mut Vec<(String, Value)>,
        filter: &'a mut Where,
    },
    Filter(&'a mut Where),
}

impl HookArgs<'_> {
    /// The record, for single-record points.
    pub fn record(&mut self) -> Option<&mut Record> {
        match self {
            HookArgs::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn records(&mut self) -> Option<&mut Vec<Record>> {
        match self {
            HookArgs::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn find_options(&mut self) -> Option<&mut FindOptions> {
        match self {
            HookArgs::Find(options) => Some(options),
            _ => None,
        }
    }

    /// The filter of a bulk or filter-only point.
    pub fn filter(&mut self) -> Option<&mut Where> {
        match self {
            HookArgs::Bulk { filter, .. } | HookArgs::Filter(filter) => Some(filter),
            _ => None,
        }
    }
}

/// A hook callback.
pub type HookFn = Box<dyn Fn(&mut HookArgs<'_>) -> Result<()> + Send + Sync>;

struct RegisteredHook {
    name: Option<String>,
    hook: HookFn,
}

/// Hooks keyed by entity and lifecycle point, run in registration order.
#[derive(Default)]
pub struct HookPipeline {
    hooks: HashMap<(String, HookPoint), Vec<RegisteredHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, entity: impl Into<String>, point: HookPoint, hook: F)
    where
        F: Fn(&mut HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.push(entity.into(), point, None, Box::new(hook));
    }

    /// Register a hook that can later be removed by name.
    pub fn add_named<F>(
        &mut self,
        entity: impl Into<String>,
        point: HookPoint,
        name: impl Into<String>,
        hook: F,
    ) where
        F: Fn(&mut HookArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.push(entity.into(), point, Some(name.into()), Box::new(hook));
    }

    fn push(&mut self, entity: String, point: HookPoint, name: Option<String>, hook: HookFn) {
        tracing::trace!(entity = %entity, hook = %point, name = ?name, "Registering hook");
        self.hooks
            .entry((entity, point))
            .or_default()
            .push(RegisteredHook { name, hook });
    }

    /// Remove named hooks; returns how many were removed.
    pub fn remove(&mut self, entity: &str, point: HookPoint, name: &str) -> usize {
        let Some(list) = self.hooks.get_mut(&(entity.to_string(), point)) else {
            return 0;
        };
        let before = list.len();
        list.retain(|h| h.name.as_deref() != Some(name));
        before - list.len()
    }

    pub fn has(&self, entity: &str, point: HookPoint) -> bool {
        self.hooks
            .get(&(entity.to_string(), point))
            .is_some_and(|list| !list.is_empty())
    }

    /// Drop every hook of an entity, or all hooks when `entity` is `None`.
    pub fn clear(&mut self, entity: Option<&str>) {
        match entity {
            Some(entity) => self.hooks.retain(|(e, _), _| e != entity),
            None => self.hooks.clear(),
        }
    }

    /// Run the hooks of one point in order, stopping at the first failure.
    pub fn run(&self, entity: &str, point: HookPoint, args: &mut HookArgs<'_>) -> Result<()> {
        let Some(list) = self.hooks.get(&(entity.to_string(), point)) else {
            return Ok(());
        };
        for registered in list {
            tracing::trace!(entity, hook = %point, name = ?registered.name, "Running hook");
            if let Err(e) = (registered.hook)(args) {
                tracing::debug!(entity, hook = %point, error = %e, "Hook aborted operation");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(String, usize)> = self
            .hooks
            .iter()
            .map(|((entity, point), list)| (format!("{entity}.{point}"), list.len()))
            .collect();
        counts.sort();
        f.debug_struct("HookPipeline").field("hooks", &counts).finish()
    }
}

/// Error raised by a hook that rejects an operation.
pub fn hook_error(point: HookPoint, message: impl Into<String>) -> Error {
    Error::Hook(relmap_core::HookError {
        hook: point.as_str().to_string(),
        message: message.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relmap_core::{AttributeDef, DataType, Schema, SchemaOptions};

    fn user_record() -> Record {
        let schema = Arc::new(
            Schema::register(
                "User",
                vec![AttributeDef::new("name", DataType::Text)],
                SchemaOptions::new().timestamps(false),
            )
            .expect("schema"),
        );
        Record::build(&schema, [("name", "ann")], Default::default()).expect("record")
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let mut pipeline = HookPipeline::new();
        pipeline.add("User", HookPoint::BeforeSave, |args| {
            let record = args.record().expect("record");
            let name = record.get("name");
            record.set("name", format!("{}-1", name.as_str().unwrap_or_default()))
        });
        pipeline.add("User", HookPoint::BeforeSave, |args| {
            let record = args.record().expect("record");
            let name = record.get("name");
            record.set("name", format!("{}-2", name.as_str().unwrap_or_default()))
        });

        let mut record = user_record();
        pipeline
            .run("User", HookPoint::BeforeSave, &mut HookArgs::Record(&mut record))
            .expect("hooks");
        assert_eq!(record.get("name"), Value::Text("ann-1-2".into()));
    }

    #[test]
    fn test_first_error_stops_pipeline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = HookPipeline::new();
        pipeline.add("User", HookPoint::BeforeDestroy, |_| {
            Err(hook_error(HookPoint::BeforeDestroy, "locked"))
        });
        let counter = Arc::clone(&calls);
        pipeline.add("User", HookPoint::BeforeDestroy, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut record = user_record();
        let err = pipeline
            .run("User", HookPoint::BeforeDestroy, &mut HookArgs::Record(&mut record))
            .unwrap_err();
        assert!(matches!(err, Error::Hook(ref h) if h.hook == "beforeDestroy"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_named_and_scoping_by_entity() {
        let mut pipeline = HookPipeline::new();
        pipeline.add_named("User", HookPoint::AfterFind, "audit", |_| Ok(()));
        pipeline.add("User", HookPoint::AfterFind, |_| Ok(()));
        assert!(pipeline.has("User", HookPoint::AfterFind));
        assert!(!pipeline.has("Post", HookPoint::AfterFind));

        assert_eq!(pipeline.remove("User", HookPoint::AfterFind, "audit"), 1);
        assert_eq!(pipeline.remove("User", HookPoint::AfterFind, "audit"), 0);
        assert!(pipeline.has("User", HookPoint::AfterFind));

        pipeline.clear(Some("User"));
        assert!(!pipeline.has("User", HookPoint::AfterFind));
    }

    #[test]
    fn test_bulk_args_expose_filter() {
        let mut pipeline = HookPipeline::new();
        pipeline.add("User", HookPoint::BeforeBulkDestroy, |args| {
            let filter = args.filter().expect("filter");
            *filter = filter.clone().and(Where::eq("name", "ann"));
            Ok(())
        });
        let mut filter = Where::all();
        pipeline
            .run("User", HookPoint::BeforeBulkDestroy, &mut HookArgs::Filter(&mut filter))
            .expect("hooks");
        assert!(filter.fields().contains(&"name"));
    }
}
