//! Reads: planning a find through scopes and hooks, running it against
//! storage and turning the rows into records.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::{
    EmptyResultError, Error, FindOptions, Op, Record, Related, Result, Value, Where,
};
use relmap_query::{IncludePlanner, QueryPlan, ScopedView, apply_scope, conform};

use crate::BoxOutcome;
use crate::coordinator::{PersistenceCoordinator, SaveOptions};
use crate::hooks::{HookArgs, HookPoint};
use crate::hydrate::hydrate;
use crate::storage::{Aggregate, Storage};
use crate::validator::Validator;

impl<S: Storage, V: Validator> PersistenceCoordinator<S, V> {
    /// Resolve find options into a plan: scope injection, include
    /// expansion and planning, with the find hooks in between.
    pub fn plan_find(&self, view: &ScopedView, mut options: FindOptions) -> Result<QueryPlan> {
        let schema = view.schema();
        let entity = view.entity();
        let hooks = options.hooks;
        if hooks {
            self.hooks.run(entity, HookPoint::BeforeFind, &mut HookArgs::Find(&mut options))?;
        }
        let mut find = conform(&self.registry, schema, &options)?;
        apply_scope(&self.registry, schema, &mut find, &view.active_scope())?;
        if hooks {
            self.hooks.run(
                entity,
                HookPoint::BeforeFindAfterExpandIncludeAll,
                &mut HookArgs::Normalized(&mut find),
            )?;
        }
        let mut plan = IncludePlanner::new(&self.registry).validate(&find, schema)?;
        if hooks {
            self.hooks.run(entity, HookPoint::BeforeFindAfterOptions, &mut HookArgs::Plan(&mut plan))?;
        }
        Ok(plan)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entity = %view.entity()))]
    pub async fn find_all(&self, cx: &Cx, view: &ScopedView, options: FindOptions) -> Outcome<Vec<Record>, Error> {
        let hooks = options.hooks;
        let reject_on_empty = options.reject_on_empty;
        let plan = try_result!(self.plan_find(view, options));
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let rows = try_outcome!(self.storage.select(cx, &plan).await);
        let mut records = try_result!(hydrate(&self.registry, &plan, &rows));
        if !plan.raw {
            try_outcome!(self.fetch_separate(cx, &plan, &mut records).await);
        }
        if hooks {
            try_result!(self.hooks.run(view.entity(), HookPoint::AfterFind, &mut HookArgs::Records(&mut records)));
        }
        tracing::debug!(entity = %view.entity(), rows = rows.len(), records = records.len(), "Find complete");

        if reject_on_empty && records.is_empty() {
            return Outcome::Err(Error::EmptyResult(EmptyResultError {
                entity: view.entity().to_string(),
            }));
        }
        Outcome::Ok(records)
    }

    /// First match, limiting the query to one row unless a limit is set.
    pub async fn find_one(&self, cx: &Cx, view: &ScopedView, mut options: FindOptions) -> Outcome<Option<Record>, Error> {
        if options.limit.is_none() {
            options.limit = Some(1);
        }
        let records = try_outcome!(self.find_all(cx, view, options).await);
        Outcome::Ok(records.into_iter().next())
    }

    /// Look a record up by its (single) primary key.
    pub async fn find_by_pk(
        &self,
        cx: &Cx,
        view: &ScopedView,
        key: impl Into<Value> + Send,
        options: FindOptions,
    ) -> Outcome<Option<Record>, Error> {
        let key = key.into();
        if key.is_null() {
            return Outcome::Ok(None);
        }
        let filter = Where::eq(view.schema().primary_key(), key);
        let options = FindOptions {
            filter: Some(Where::conjoin(options.filter.clone(), filter)),
            ..options
        };
        self.find_one(cx, view, options).await
    }

    /// Number of root records matching the options. Limit, offset and
    /// order are ignored.
    pub async fn count(&self, cx: &Cx, view: &ScopedView, mut options: FindOptions) -> Outcome<u64, Error> {
        if options.hooks {
            try_result!(self.hooks.run(view.entity(), HookPoint::BeforeCount, &mut HookArgs::Find(&mut options)));
        }
        options.hooks = false;
        options.limit = None;
        options.offset = None;
        options.order.clear();
        let distinct = options.distinct;

        let plan = try_result!(self.plan_find(view, options));
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        self.storage.count(cx, &plan, distinct || plan.has_includes()).await
    }

    /// Matching records plus the total count ignoring limit and offset.
    pub async fn find_and_count(
        &self,
        cx: &Cx,
        view: &ScopedView,
        options: FindOptions,
    ) -> Outcome<(u64, Vec<Record>), Error> {
        let count_options = FindOptions {
            attributes: None,
            ..options.clone()
        };
        let count = try_outcome!(self.count(cx, view, count_options).await);
        if count == 0 {
            return Outcome::Ok((0, Vec::new()));
        }
        let records = try_outcome!(self.find_all(cx, view, options).await);
        Outcome::Ok((count, records))
    }

    /// Run an aggregate over one attribute of the matching records.
    pub async fn aggregate(
        &self,
        cx: &Cx,
        view: &ScopedView,
        field: &str,
        function: Aggregate,
        mut options: FindOptions,
    ) -> Outcome<Value, Error> {
        if !view.schema().has_attribute(field) {
            return Outcome::Err(Error::request(format!(
                "Unknown attribute {field} on {}",
                view.entity()
            )));
        }
        options.limit = None;
        options.offset = None;
        options.order.clear();
        let plan = try_result!(self.plan_find(view, options));
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(entity = %view.entity(), field, function = function.as_str(), "Aggregating");
        self.storage.aggregate(cx, &plan, function, field).await
    }

    /// Find a record matching `filter`, or create one from `defaults` plus
    /// the equalities of `filter`.
    ///
    /// Returns the record and whether it was created. A unique-constraint
    /// failure on create means a concurrent writer got there first; the
    /// find is retried once. The error is surfaced when the conflicting
    /// values disagree with the filter or the retry still finds nothing.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %view.entity()))]
    pub async fn find_or_create(
        &self,
        cx: &Cx,
        view: &ScopedView,
        filter: Where,
        defaults: Vec<(String, Value)>,
    ) -> Outcome<(Record, bool), Error> {
        let options = FindOptions::new().filter(filter.clone());
        if let Some(found) = try_outcome!(self.find_one(cx, view, options.clone()).await) {
            return Outcome::Ok((found, false));
        }

        let mut values = defaults;
        for (field, value) in equality_pairs(&filter) {
            if !values.iter().any(|(f, _)| *f == field) {
                values.push((field, value));
            }
        }
        let error = match self.create(cx, view.entity(), values, &SaveOptions::new()).await {
            Outcome::Ok(record) => return Outcome::Ok((record, true)),
            Outcome::Err(e) if e.is_unique_violation() => e,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        };

        if let Error::UniqueConstraint(conflict) = &error {
            let disagrees = conflict.fields.iter().any(|(field, value)| {
                filter
                    .equality_on(field)
                    .is_some_and(|wanted| !wanted.sql_eq(value))
            });
            if disagrees {
                tracing::debug!(entity = %view.entity(), "Unique conflict does not match the filter");
                return Outcome::Err(error);
            }
        }
        tracing::debug!(entity = %view.entity(), "Lost create race; finding again");
        match try_outcome!(self.find_one(cx, view, options).await) {
            Some(found) => Outcome::Ok((found, false)),
            None => Outcome::Err(error),
        }
    }

    /// Fetch the separate includes of a plan, one query per include keyed
    /// by the parent keys, and attach the results.
    fn fetch_separate<'a>(
        &'a self,
        cx: &'a Cx,
        plan: &'a QueryPlan,
        records: &'a mut [Record],
    ) -> BoxOutcome<'a, ()> {
        Box::pin(async move {
            for id in plan.separate_roots() {
                let node = plan.node(id);
                let association = Arc::clone(&node.association);
                let source_key = association.source_key_name().to_string();
                let foreign_key = association.foreign_key.clone();
                let path: Vec<String> = plan.path(id).iter().map(|s| (*s).to_string()).collect();
                let Some((alias, parent_path)) = path.split_last() else {
                    continue;
                };

                let mut parents = collect_at_path(records, parent_path);
                let mut keys: Vec<Value> = Vec::new();
                for parent in &parents {
                    let key = parent.get(&source_key);
                    if !key.is_null() && !keys.iter().any(|k| k.sql_eq(&key)) {
                        keys.push(key);
                    }
                }
                if keys.is_empty() {
                    for parent in &mut parents {
                        parent.set_related(alias.clone(), Related::Many(Vec::new()));
                    }
                    continue;
                }

                let mut sub = plan.extract_subtree(id);
                sub.filter = Some(Where::conjoin(sub.filter.take(), Where::in_list(foreign_key.clone(), keys)));
                tracing::debug!(alias = %alias, model = %sub.model, parents = parents.len(), "Fetching separate include");
                let rows = try_outcome!(self.storage.select(cx, &sub).await);
                let mut children = try_result!(hydrate(&self.registry, &sub, &rows));
                try_outcome!(self.fetch_separate(cx, &sub, &mut children).await);

                for parent in &mut parents {
                    let key = parent.get(&source_key);
                    let mine: Vec<Record> = children
                        .iter()
                        .filter(|c| c.get_data_value(&foreign_key).is_some_and(|v| v.sql_eq(&key)))
                        .cloned()
                        .collect();
                    parent.set_related(alias.clone(), Related::Many(mine));
                }
            }
            Outcome::Ok(())
        })
    }
}

/// Top-level `field = value` pairs of a filter.
pub(crate) fn equality_pairs(filter: &Where) -> Vec<(String, Value)> {
    match filter {
        Where::Cmp {
            field,
            op: Op::Eq,
            value,
        } => vec![(field.clone(), value.clone())],
        Where::And(parts) => parts.iter().flat_map(equality_pairs).collect(),
        _ => Vec::new(),
    }
}

/// Records reached from `records` by following the aliases of `path`.
fn collect_at_path<'r>(records: &'r mut [Record], path: &[String]) -> Vec<&'r mut Record> {
    records.iter_mut().flat_map(|r| descend(r, path)).collect()
}

fn descend<'r>(record: &'r mut Record, path: &[String]) -> Vec<&'r mut Record> {
    let Some((head, rest)) = path.split_first() else {
        return vec![record];
    };
    match record.related_mut(head) {
        Some(related) => related
            .records_mut()
            .into_iter()
            .flat_map(|child| descend(child, rest))
            .collect(),
        None => Vec::new(),
    }
}
