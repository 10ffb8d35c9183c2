//! Set-wise writes.
//!
//! Each operation has two modes. By default one batched storage call does
//! the work and only the bulk hooks fire. With `individual_hooks` every
//! affected record goes through its own single-record lifecycle.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::{
    BulkValidationError, Error, FindOptions, NotParanoidError, Record, RecordValidationError,
    Result, Schema, SetOptions, Value, Where,
};
use relmap_query::{ScopedView, paranoid_clause};

use crate::coordinator::{PersistenceCoordinator, SaveOptions, unlisted};
use crate::hooks::{HookArgs, HookPoint};
use crate::storage::{BulkInsertOptions, Storage};
use crate::validator::{ValidateOptions, Validator};

/// Options shared by the bulk operations.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub validate: bool,
    /// Run the bulk hooks
    pub hooks: bool,
    /// Run the single-record lifecycle, hooks included, per record
    pub individual_hooks: bool,
    /// Attributes to write; all given attributes when `None`
    pub fields: Option<Vec<String>>,
    /// Skip rows that collide with a unique key on create
    pub ignore_duplicates: bool,
    /// Delete rows of a paranoid entity instead of stamping them
    pub force: bool,
    /// Leave soft-deleted rows alone
    pub paranoid: bool,
    pub silent: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            validate: true,
            hooks: true,
            individual_hooks: false,
            fields: None,
            ignore_duplicates: false,
            force: false,
            paranoid: true,
            silent: false,
        }
    }
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn hooks(mut self, hooks: bool) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn individual_hooks(mut self, individual: bool) -> Self {
        self.individual_hooks = individual;
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn ignore_duplicates(mut self, ignore: bool) -> Self {
        self.ignore_duplicates = ignore;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

impl<S: Storage, V: Validator> PersistenceCoordinator<S, V> {
    /// Build and insert many records.
    ///
    /// Validation runs over the whole batch before anything is written, and
    /// every failure is reported in one [`BulkValidationError`].
    #[tracing::instrument(level = "debug", skip_all, fields(entity = entity, rows = rows.len()))]
    pub async fn bulk_create(
        &self,
        cx: &Cx,
        entity: &str,
        rows: Vec<Vec<(String, Value)>>,
        options: &BulkOptions,
    ) -> Outcome<Vec<Record>, Error> {
        let schema = Arc::clone(try_result!(self.registry.schema(entity)));
        let mut records = try_result!(
            rows.into_iter()
                .map(|values| self.build(entity, values))
                .collect::<Result<Vec<Record>>>()
        );
        if records.is_empty() {
            return Outcome::Ok(records);
        }
        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::BeforeBulkCreate, &mut HookArgs::Records(&mut records)));
        }

        if options.validate {
            let skip = options
                .fields
                .as_ref()
                .map(|fields| unlisted(&schema, fields))
                .unwrap_or_default();
            let validate = ValidateOptions::skip(skip);
            let mut errors = Vec::new();
            for (index, record) in records.iter_mut().enumerate() {
                match self.validate_with(cx, record, &validate, options.individual_hooks).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(Error::Validation(error)) => errors.push(RecordValidationError { index, error }),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                    Outcome::Panicked(payload) => return Outcome::Panicked(payload),
                }
            }
            if !errors.is_empty() {
                tracing::debug!(entity, failed = errors.len(), "Bulk validation failed");
                return Outcome::Err(Error::BulkValidation(BulkValidationError { errors }));
            }
        }

        if options.individual_hooks {
            let save = SaveOptions {
                fields: options.fields.clone(),
                validate: false,
                hooks: true,
                silent: options.silent,
            };
            for record in &mut records {
                try_outcome!(self.save(cx, record, &save).await);
            }
        } else {
            try_outcome!(self.insert_batch(cx, &schema, &mut records, options).await);
        }

        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::AfterBulkCreate, &mut HookArgs::Records(&mut records)));
        }
        tracing::info!(entity, records = records.len(), "Bulk create complete");
        Outcome::Ok(records)
    }

    async fn insert_batch(
        &self,
        cx: &Cx,
        schema: &Schema,
        records: &mut [Record],
        options: &BulkOptions,
    ) -> Outcome<(), Error> {
        let now = self.config.now();
        let mut fields: Vec<String> = match &options.fields {
            Some(fields) => fields.iter().filter(|f| schema.has_attribute(f)).cloned().collect(),
            None => schema.persisted_fields(),
        };
        for managed in [schema.created_at(), schema.updated_at(), schema.version_field()]
            .into_iter()
            .flatten()
        {
            if !fields.iter().any(|f| f == managed) {
                fields.push(managed.to_string());
            }
        }
        fields.retain(|f| !schema.is_virtual(f));

        let mut rows = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            for stamp in [schema.created_at(), schema.updated_at()].into_iter().flatten() {
                if record.get_data_value(stamp).is_none_or(Value::is_null) {
                    record.assign(stamp, Value::Timestamp(now));
                }
            }
            let mut row = Vec::with_capacity(fields.len());
            for field in &fields {
                let Some(value) = record.get_data_value(field) else {
                    continue;
                };
                let generated = schema.attribute(field).is_some_and(|a| a.auto_increment);
                if generated && value.is_null() {
                    continue;
                }
                row.push((schema.column_of(field).to_string(), value.clone()));
            }
            rows.push(row);
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let insert = BulkInsertOptions {
            ignore_duplicates: options.ignore_duplicates,
        };
        let results = try_outcome!(self.storage.bulk_insert(cx, schema, &rows, insert).await);

        for (record, result) in records.iter_mut().zip(results) {
            if result.rows_affected > 0 {
                for (column, value) in result.returned {
                    let field = schema.field_of(&column).to_string();
                    try_result!(record.set_with(&field, value, SetOptions::RAW));
                }
            }
            record.commit(&fields);
            record.mark_persisted();
        }
        Outcome::Ok(())
    }

    /// Write `values` to every record matching `filter` under the view's
    /// scope. Returns the number of rows changed.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %view.entity()))]
    pub async fn bulk_update(
        &self,
        cx: &Cx,
        view: &ScopedView,
        values: Vec<(String, Value)>,
        filter: Where,
        options: &BulkOptions,
    ) -> Outcome<u64, Error> {
        let schema = Arc::clone(view.schema());
        let entity = schema.name();
        let mut values: Vec<(String, Value)> = values
            .into_iter()
            .filter(|(field, _)| schema.has_attribute(field) && !schema.is_virtual(field))
            .filter(|(field, _)| options.fields.as_ref().is_none_or(|allowed| allowed.contains(field)))
            .collect();
        if let Some(updated_at) = schema.updated_at() {
            if !options.silent && !values.iter().any(|(f, _)| f == updated_at) {
                values.push((updated_at.to_string(), Value::Timestamp(self.config.now())));
            }
        }

        if options.validate {
            let listed: Vec<String> = values.iter().map(|(f, _)| f.clone()).collect();
            let mut probe = try_result!(self.build(entity, values.clone()));
            let validate = ValidateOptions::skip(unlisted(&schema, &listed));
            try_outcome!(self.validate_with(cx, &mut probe, &validate, options.hooks).await);
        }

        let mut filter = self.scoped_filter(view, &schema, filter, options.paranoid);
        if options.hooks {
            let mut args = HookArgs::Bulk {
                values: &mut values,
                filter: &mut filter,
            };
            try_result!(self.hooks.run(entity, HookPoint::BeforeBulkUpdate, &mut args));
        }

        let affected = if options.individual_hooks {
            let mut records = try_outcome!(self.find_matching(cx, view, &filter).await);
            let fields: Vec<String> = values.iter().map(|(f, _)| f.clone()).collect();
            let save = SaveOptions {
                fields: Some(fields),
                validate: false,
                hooks: true,
                silent: options.silent,
            };
            for record in &mut records {
                try_result!(record.set_all(values.iter().map(|(f, v)| (f, v.clone())), SetOptions::default()));
                try_outcome!(self.save(cx, record, &save).await);
            }
            u64::try_from(records.len()).unwrap_or(u64::MAX)
        } else {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let columns = to_columns(&schema, &values);
            try_outcome!(self.storage.bulk_update(cx, &schema, &columns, &filter).await)
        };

        if options.hooks {
            let mut args = HookArgs::Bulk {
                values: &mut values,
                filter: &mut filter,
            };
            try_result!(self.hooks.run(entity, HookPoint::AfterBulkUpdate, &mut args));
        }
        tracing::info!(entity, affected, "Bulk update complete");
        Outcome::Ok(affected)
    }

    /// Delete, or stamp as deleted, every record matching `filter` under
    /// the view's scope. Returns the number of rows affected.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %view.entity()))]
    pub async fn bulk_destroy(
        &self,
        cx: &Cx,
        view: &ScopedView,
        filter: Where,
        options: &BulkOptions,
    ) -> Outcome<u64, Error> {
        let schema = Arc::clone(view.schema());
        let entity = schema.name();
        let now = self.config.now();
        let mut filter = self.scoped_filter(view, &schema, filter, false);
        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::BeforeBulkDestroy, &mut HookArgs::Filter(&mut filter)));
        }

        let soft = schema.deleted_at().filter(|_| !options.force);
        let mut records = Vec::new();
        if options.individual_hooks {
            let live = match soft {
                Some(deleted_at) => filter.clone().and(deleted_clause(&schema, deleted_at, now, false)),
                None => filter.clone(),
            };
            records = try_outcome!(self.find_matching(cx, view, &live).await);
            for record in &mut records {
                try_result!(self.run_record_hook(HookPoint::BeforeDestroy, record));
            }
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let affected = match soft {
            Some(deleted_at) => {
                let live = filter.clone().and(deleted_clause(&schema, deleted_at, now, false));
                let values = vec![(schema.column_of(deleted_at).to_string(), Value::Timestamp(now))];
                try_outcome!(self.storage.bulk_update(cx, &schema, &values, &live).await)
            }
            None => try_outcome!(self.storage.bulk_delete(cx, &schema, &filter).await),
        };

        for record in &mut records {
            if let Some(deleted_at) = soft {
                try_result!(record.set_with(deleted_at, Value::Timestamp(now), SetOptions::RAW));
            }
            try_result!(self.run_record_hook(HookPoint::AfterDestroy, record));
        }
        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::AfterBulkDestroy, &mut HookArgs::Filter(&mut filter)));
        }
        tracing::info!(entity, affected, soft = soft.is_some(), "Bulk destroy complete");
        Outcome::Ok(affected)
    }

    /// Clear the deletion stamp of every soft-deleted record matching
    /// `filter`. Returns the number of rows restored.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %view.entity()))]
    pub async fn bulk_restore(
        &self,
        cx: &Cx,
        view: &ScopedView,
        filter: Where,
        options: &BulkOptions,
    ) -> Outcome<u64, Error> {
        let schema = Arc::clone(view.schema());
        let entity = schema.name();
        let Some(deleted_at) = schema.deleted_at() else {
            return Outcome::Err(Error::NotParanoid(NotParanoidError {
                entity: entity.to_string(),
                operation: "bulk_restore",
            }));
        };
        let now = self.config.now();
        let mut filter = self.scoped_filter(view, &schema, filter, false);
        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::BeforeBulkRestore, &mut HookArgs::Filter(&mut filter)));
        }

        let deleted = filter.clone().and(deleted_clause(&schema, deleted_at, now, true));
        let mut records = Vec::new();
        if options.individual_hooks {
            records = try_outcome!(self.find_matching(cx, view, &deleted).await);
            for record in &mut records {
                try_result!(self.run_record_hook(HookPoint::BeforeRestore, record));
            }
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let cleared = cleared_value(&schema, deleted_at, now);
        let values = vec![(schema.column_of(deleted_at).to_string(), cleared.clone())];
        let affected = try_outcome!(self.storage.bulk_update(cx, &schema, &values, &deleted).await);

        for record in &mut records {
            try_result!(record.set_with(deleted_at, cleared.clone(), SetOptions::RAW));
            try_result!(self.run_record_hook(HookPoint::AfterRestore, record));
        }
        if options.hooks {
            try_result!(self.hooks.run(entity, HookPoint::AfterBulkRestore, &mut HookArgs::Filter(&mut filter)));
        }
        tracing::info!(entity, affected, "Bulk restore complete");
        Outcome::Ok(affected)
    }

    /// `filter` conjoined with the view's scope filter and, when asked,
    /// the deletion filter.
    fn scoped_filter(&self, view: &ScopedView, schema: &Schema, filter: Where, paranoid: bool) -> Where {
        let mut filter = Where::conjoin(view.active_scope().filter, filter);
        if paranoid {
            if let Some(clause) = paranoid_clause(schema) {
                filter = filter.and(clause);
            }
        }
        filter
    }

    /// Records matching an already scoped filter.
    async fn find_matching(&self, cx: &Cx, view: &ScopedView, filter: &Where) -> Outcome<Vec<Record>, Error> {
        let options = FindOptions::new()
            .filter(filter.clone())
            .paranoid(false)
            .hooks(false);
        self.find_all(cx, &view.unscoped(), options).await
    }
}

/// The value a live record holds in its deletion attribute.
fn cleared_value(schema: &Schema, deleted_at: &str, now: i64) -> Value {
    schema
        .default_for(deleted_at)
        .map_or(Value::Null, |d| d.resolve(now))
}

/// Rows that are live, or with `deleted` set, rows that are soft-deleted.
fn deleted_clause(schema: &Schema, deleted_at: &str, now: i64, deleted: bool) -> Where {
    match (cleared_value(schema, deleted_at, now), deleted) {
        (Value::Null, false) => Where::is_null(deleted_at),
        (Value::Null, true) => Where::not_null(deleted_at),
        (value, false) => Where::eq(deleted_at, value),
        (value, true) => Where::ne(deleted_at, value),
    }
}

fn to_columns(schema: &Schema, values: &[(String, Value)]) -> Vec<(String, Value)> {
    values
        .iter()
        .map(|(field, value)| (schema.column_of(field).to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{AttributeDef, DataType, Registry, Scope, SchemaOptions};

    use crate::memory::MemoryStorage;
    use crate::validator::{FieldRule, RuleValidator};

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .define(
                    "Item",
                    vec![
                        AttributeDef::new("sku", DataType::Text).not_null().unique(),
                        AttributeDef::new("qty", DataType::Integer),
                        AttributeDef::new("shelf", DataType::Text),
                    ],
                    SchemaOptions::new()
                        .paranoid(true)
                        .scope("front", Scope::new().filter(Where::eq("shelf", "front"))),
                )
                .and_then(|b| {
                    b.define(
                        "Tally",
                        vec![AttributeDef::new("n", DataType::Integer)],
                        SchemaOptions::new().timestamps(false),
                    )
                })
                .and_then(|b| b.build())
                .expect("registry"),
        )
    }

    fn coordinator() -> PersistenceCoordinator<MemoryStorage> {
        let registry = registry();
        let validator = RuleValidator::new().rule(
            "Item",
            "qty",
            FieldRule::Range {
                min: Some(0.0),
                max: None,
            },
        );
        PersistenceCoordinator::with_validator(Arc::clone(&registry), MemoryStorage::new(registry), validator)
    }

    fn item(sku: &str, qty: i64, shelf: &str) -> Vec<(String, Value)> {
        vec![
            ("sku".to_string(), Value::from(sku)),
            ("qty".to_string(), Value::BigInt(qty)),
            ("shelf".to_string(), Value::from(shelf)),
        ]
    }

    async fn stocked(cx: &Cx, coordinator: &PersistenceCoordinator<MemoryStorage>) -> Vec<Record> {
        let rows = vec![
            item("a", 1, "front"),
            item("b", 2, "back"),
            item("c", 3, "front"),
        ];
        unwrap_outcome(coordinator.bulk_create(cx, "Item", rows, &BulkOptions::new()).await)
    }

    #[test]
    fn test_bulk_create_is_one_batched_write() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            let seen = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&seen);
            coordinator.hooks_mut().add("Item", HookPoint::AfterBulkCreate, move |args| {
                counter.store(args.records().expect("records").len(), Ordering::SeqCst);
                Ok(())
            });
            let items = stocked(&cx, &coordinator).await;
            assert_eq!(coordinator.storage().writes(), 1);
            assert_eq!(seen.load(Ordering::SeqCst), 3);
            let ids: Vec<Option<i64>> = items.iter().map(|r| r.get("id").as_i64()).collect();
            assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
            assert!(items.iter().all(|r| !r.is_new() && !r.has_changes()));
            assert!(items.iter().all(|r| !r.get("created_at").is_null()));
        });
    }

    #[test]
    fn test_bulk_create_collects_every_validation_failure() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let rows = vec![
                item("a", -1, "front"),
                item("b", 2, "back"),
                vec![("qty".to_string(), Value::BigInt(1))],
            ];
            match coordinator.bulk_create(&cx, "Item", rows, &BulkOptions::new()).await {
                Outcome::Err(Error::BulkValidation(bulk)) => {
                    let indexes: Vec<usize> = bulk.errors.iter().map(|e| e.index).collect();
                    assert_eq!(indexes, vec![0, 2]);
                    assert_eq!(bulk.errors[1].error.fields(), vec!["sku"]);
                }
                other => panic!("expected BulkValidation, got {other:?}"),
            }
            assert_eq!(coordinator.storage().writes(), 0);
        });
    }

    #[test]
    fn test_bulk_create_ignoring_duplicates() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            stocked(&cx, &coordinator).await;
            let rows = vec![item("a", 5, "front"), item("d", 4, "back")];
            let options = BulkOptions::new().ignore_duplicates(true);
            let items = unwrap_outcome(coordinator.bulk_create(&cx, "Item", rows, &options).await);
            assert!(items[0].get("id").is_null());
            assert!(!items[1].get("id").is_null());
            assert_eq!(coordinator.storage().rows("Item").expect("rows").len(), 4);
        });
    }

    #[test]
    fn test_individual_create_runs_record_hooks() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            coordinator.hooks_mut().add("Tally", HookPoint::BeforeCreate, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            let rows = (1..=3)
                .map(|n| vec![("n".to_string(), Value::BigInt(n))])
                .collect();
            let options = BulkOptions::new().individual_hooks(true);
            unwrap_outcome(coordinator.bulk_create(&cx, "Tally", rows, &options).await);
            assert_eq!(calls.load(Ordering::SeqCst), 3);
            assert_eq!(coordinator.storage().writes(), 3);
        });
    }

    #[test]
    fn test_bulk_update_respects_scope_and_validation() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            stocked(&cx, &coordinator).await;
            let front = coordinator.view("Item").expect("view").scope(&["front"]).expect("scope");
            let values = vec![("qty".to_string(), Value::BigInt(10))];
            let affected = unwrap_outcome(
                coordinator
                    .bulk_update(&cx, &front, values, Where::all(), &BulkOptions::new())
                    .await,
            );
            assert_eq!(affected, 2);

            let invalid = vec![("qty".to_string(), Value::BigInt(-5))];
            match coordinator.bulk_update(&cx, &front, invalid, Where::all(), &BulkOptions::new()).await {
                Outcome::Err(Error::Validation(v)) => assert_eq!(v.fields(), vec!["qty"]),
                other => panic!("expected Validation, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_bulk_update_individually_saves_each_record() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            stocked(&cx, &coordinator).await;
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            coordinator.hooks_mut().add("Item", HookPoint::AfterUpdate, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            let view = coordinator.view("Item").expect("view");
            let values = vec![("shelf".to_string(), Value::from("top"))];
            let options = BulkOptions::new().individual_hooks(true);
            let affected = unwrap_outcome(
                coordinator
                    .bulk_update(&cx, &view, values, Where::lt("qty", 3), &options)
                    .await,
            );
            assert_eq!(affected, 2);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_bulk_destroy_soft_then_restore_then_force() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            stocked(&cx, &coordinator).await;
            let view = coordinator.view("Item").expect("view");

            let gone = unwrap_outcome(
                coordinator
                    .bulk_destroy(&cx, &view, Where::eq("shelf", "front"), &BulkOptions::new())
                    .await,
            );
            assert_eq!(gone, 2);
            let live = unwrap_outcome(coordinator.count(&cx, &view, FindOptions::new()).await);
            assert_eq!(live, 1);
            let all = unwrap_outcome(coordinator.count(&cx, &view, FindOptions::new().paranoid(false)).await);
            assert_eq!(all, 3);

            let back = unwrap_outcome(coordinator.bulk_restore(&cx, &view, Where::all(), &BulkOptions::new()).await);
            assert_eq!(back, 2);

            let options = BulkOptions::new().force(true);
            let deleted = unwrap_outcome(coordinator.bulk_destroy(&cx, &view, Where::all(), &options).await);
            assert_eq!(deleted, 3);
            assert!(coordinator.storage().rows("Item").expect("rows").is_empty());
        });
    }

    #[test]
    fn test_bulk_restore_requires_paranoid_entity() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let view = coordinator.view("Tally").expect("view");
            match coordinator.bulk_restore(&cx, &view, Where::all(), &BulkOptions::new()).await {
                Outcome::Err(Error::NotParanoid(e)) => assert_eq!(e.entity, "Tally"),
                other => panic!("expected NotParanoid, got {other:?}"),
            }
        });
    }
}
