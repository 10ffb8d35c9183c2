//! Single-record lifecycle.
//!
//! A save walks the record through field selection, timestamps,
//! validation, the before hooks, parent cascades, the storage write,
//! child cascades and the after hooks, then reconciles the record with
//! what storage returned. Any failure before the storage write leaves the
//! record exactly as it was handed in.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::{
    AssociationKind, AttachedInclude, BuildOptions, EmptyResultError, Error, FindOptions,
    IncludeOptions, IncludeRequest, NotParanoidError, OptimisticLockError, Record, Registry,
    Related, Result, Schema, SetOptions, Value,
};
use relmap_query::{IncludePlanner, ScopedView, conform};

use crate::BoxOutcome;
use crate::config::PersistConfig;
use crate::finder::equality_pairs;
use crate::hooks::{HookArgs, HookPipeline, HookPoint};
use crate::hydrate::attached_includes;
use crate::storage::Storage;
use crate::validator::{RuleValidator, ValidateOptions, Validator};

/// Options for [`PersistenceCoordinator::save`].
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Attributes to write. `None` writes every attribute of a new record
    /// and the changed attributes of an existing one.
    pub fields: Option<Vec<String>>,
    pub validate: bool,
    pub hooks: bool,
    /// Leave the update timestamp of an existing record alone
    pub silent: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            fields: None,
            validate: true,
            hooks: true,
            silent: false,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn hooks(mut self, hooks: bool) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Options for records saved as part of another record's save.
    fn nested(&self) -> Self {
        Self {
            fields: None,
            ..self.clone()
        }
    }
}

/// Options for [`PersistenceCoordinator::destroy`] and
/// [`PersistenceCoordinator::restore`].
#[derive(Debug, Clone, Copy)]
pub struct DestroyOptions {
    /// Delete the row even when the entity is paranoid
    pub force: bool,
    pub hooks: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            force: false,
            hooks: true,
        }
    }
}

impl DestroyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn hooks(mut self, hooks: bool) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Drives records of a registry through their lifecycle against one
/// storage backend.
pub struct PersistenceCoordinator<S, V = RuleValidator> {
    pub(crate) registry: Arc<Registry>,
    pub(crate) storage: S,
    pub(crate) validator: V,
    pub(crate) hooks: HookPipeline,
    pub(crate) config: PersistConfig,
}

impl<S: Storage> PersistenceCoordinator<S> {
    /// Coordinator validating with an empty [`RuleValidator`], which still
    /// enforces non-nullable attributes.
    pub fn new(registry: Arc<Registry>, storage: S) -> Self {
        Self::with_validator(registry, storage, RuleValidator::new())
    }
}

impl<S: Storage, V: Validator> PersistenceCoordinator<S, V> {
    pub fn with_validator(registry: Arc<Registry>, storage: S, validator: V) -> Self {
        Self {
            registry,
            storage,
            validator,
            hooks: HookPipeline::new(),
            config: PersistConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookPipeline {
        &mut self.hooks
    }

    pub fn schema(&self, entity: &str) -> Result<&Arc<Schema>> {
        self.registry.schema(entity)
    }

    /// Query view of an entity under its default scope.
    pub fn view(&self, entity: &str) -> Result<ScopedView> {
        Ok(ScopedView::new(Arc::clone(self.registry.schema(entity)?)))
    }

    /// Build a new, unsaved record.
    pub fn build<I, K, T>(&self, entity: &str, values: I) -> Result<Record>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Value>,
    {
        self.build_with_include(entity, values, Vec::new())
    }

    /// Build a new record whose include aliases accept nested documents.
    ///
    /// Nested records are saved along with the record: belongs-to parents
    /// first, children and many-to-many links after.
    pub fn build_with_include<I, K, T>(
        &self,
        entity: &str,
        values: I,
        include: Vec<IncludeRequest>,
    ) -> Result<Record>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Value>,
    {
        let schema = self.registry.schema(entity)?;
        let include = self.resolve_includes(schema, include)?;
        let options = BuildOptions::default()
            .include(include)
            .now(self.config.now());
        Record::build(schema, values, options)
    }

    fn resolve_includes(&self, schema: &Arc<Schema>, include: Vec<IncludeRequest>) -> Result<Vec<AttachedInclude>> {
        if include.is_empty() {
            return Ok(Vec::new());
        }
        let options = FindOptions {
            include,
            ..FindOptions::default()
        };
        let find = conform(&self.registry, schema, &options)?;
        let plan = IncludePlanner::new(&self.registry).validate(&find, schema)?;
        attached_includes(&self.registry, &plan, plan.roots())
    }

    /// Build and save a record.
    pub async fn create<I, K, T>(
        &self,
        cx: &Cx,
        entity: &str,
        values: I,
        options: &SaveOptions,
    ) -> Outcome<Record, Error>
    where
        I: IntoIterator<Item = (K, T)> + Send,
        K: Into<String> + Send,
        T: Into<Value> + Send,
    {
        let mut record = try_result!(self.build(entity, values));
        try_outcome!(self.save(cx, &mut record, options).await);
        Outcome::Ok(record)
    }

    /// Insert a new record or write the changes of an existing one.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %record.entity(), new = record.is_new()))]
    pub async fn save(&self, cx: &Cx, record: &mut Record, options: &SaveOptions) -> Outcome<(), Error> {
        let default_fields = options.fields.is_none();
        self.save_record(cx, record, options, default_fields).await
    }

    /// Assign `values` and save only the attributes that actually changed.
    pub async fn update<I, K, T>(
        &self,
        cx: &Cx,
        record: &mut Record,
        values: I,
        options: &SaveOptions,
    ) -> Outcome<(), Error>
    where
        I: IntoIterator<Item = (K, T)> + Send,
        K: Into<String> + Send,
        T: Into<Value> + Send,
    {
        let values: Vec<(String, Value)> = values.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let checkpoint = record.checkpoint();
        for (name, value) in &values {
            if let Err(e) = record.set_with(name, value.clone(), SetOptions::default()) {
                record.rollback(checkpoint);
                return Outcome::Err(e);
            }
        }

        let mut fields: Vec<String> = record.changed();
        if let Some(allowed) = &options.fields {
            fields.retain(|f| allowed.contains(f));
        } else {
            fields.retain(|f| values.iter().any(|(name, _)| name == f));
        }
        let options = SaveOptions {
            fields: Some(fields),
            ..options.clone()
        };
        self.save_record(cx, record, &options, true).await
    }

    fn save_boxed<'a>(&'a self, cx: &'a Cx, record: &'a mut Record, options: SaveOptions) -> BoxOutcome<'a, ()> {
        Box::pin(async move { self.save_record(cx, record, &options, true).await })
    }

    async fn save_record(
        &self,
        cx: &Cx,
        record: &mut Record,
        options: &SaveOptions,
        default_fields: bool,
    ) -> Outcome<(), Error> {
        let checkpoint = record.checkpoint();
        let was_new = record.is_new();
        let written = match self.write_record(cx, record, options, default_fields).await {
            Outcome::Ok(Some(written)) => written,
            Outcome::Ok(None) => {
                record.rollback(checkpoint);
                return Outcome::Ok(());
            }
            Outcome::Err(e) => {
                record.rollback(checkpoint);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(reason) => {
                record.rollback(checkpoint);
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => {
                record.rollback(checkpoint);
                return Outcome::Panicked(payload);
            }
        };

        // The row is stored from here on, so the record is reconciled
        // whatever the cascades and after hooks report.
        let mut outcome = if was_new {
            self.save_children(cx, record, options).await
        } else {
            Outcome::Ok(())
        };
        if matches!(outcome, Outcome::Ok(())) && options.hooks {
            let point = if was_new {
                HookPoint::AfterCreate
            } else {
                HookPoint::AfterUpdate
            };
            let hooks = self
                .run_record_hook(point, record)
                .and_then(|()| self.run_record_hook(HookPoint::AfterSave, record));
            if let Err(e) = hooks {
                outcome = Outcome::Err(e);
            }
        }
        record.commit(&written);
        record.mark_persisted();
        outcome
    }

    /// Everything up to and including the storage write.
    ///
    /// Returns the attributes written, or `None` when there was nothing
    /// to write.
    async fn write_record(
        &self,
        cx: &Cx,
        record: &mut Record,
        options: &SaveOptions,
        default_fields: bool,
    ) -> Outcome<Option<Vec<String>>, Error> {
        let schema = Arc::clone(record.schema());
        let is_new = record.is_new();
        let now = self.config.now();
        let mut fields = write_set(&schema, record, options);

        if let Some(updated_at) = schema.updated_at() {
            if options.silent && !is_new {
                fields.retain(|f| f != updated_at);
            } else if fields.iter().any(|f| f == updated_at) {
                record.assign(updated_at, Value::Timestamp(now));
            }
        }
        if is_new {
            if let Some(created_at) = schema.created_at() {
                if record.get_data_value(created_at).is_none_or(Value::is_null) {
                    record.assign(created_at, Value::Timestamp(now));
                }
            }
        }

        if options.validate {
            let skip = unlisted(&schema, &fields);
            try_outcome!(self.validate_with(cx, record, &ValidateOptions::skip(skip), options.hooks).await);
        }

        if options.hooks {
            let before = record.data_values();
            let changed_before = record.changed();
            let point = if is_new {
                HookPoint::BeforeCreate
            } else {
                HookPoint::BeforeUpdate
            };
            try_result!(self.run_record_hook(point, record));
            try_result!(self.run_record_hook(HookPoint::BeforeSave, record));

            if default_fields && !is_new {
                let introduced = hook_changed(record, &before, &changed_before, &fields, schema.updated_at());
                if !introduced.is_empty() {
                    tracing::debug!(entity = %schema.name(), fields = ?introduced, "Hooks changed additional fields");
                    for field in &introduced {
                        if !fields.contains(field) {
                            fields.push(field.clone());
                        }
                    }
                    if options.validate {
                        let skip = unlisted(&schema, &introduced);
                        try_outcome!(
                            self.validate_with(cx, record, &ValidateOptions::skip(skip), options.hooks)
                                .await
                        );
                    }
                }
            }
        }

        let real_fields: Vec<String> = fields
            .into_iter()
            .filter(|f| !schema.is_virtual(f) && schema.has_attribute(f))
            .collect();
        if real_fields.is_empty() || (!is_new && !record.has_changes()) {
            tracing::debug!(entity = %schema.name(), "Nothing to save");
            return Outcome::Ok(None);
        }

        if is_new {
            try_outcome!(self.save_parents(cx, record, options).await);
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let mut values: Vec<(String, Value)> = Vec::with_capacity(real_fields.len());
        for field in &real_fields {
            let Some(value) = record.get_data_value(field) else {
                continue;
            };
            let generated = schema.attribute(field).is_some_and(|a| a.auto_increment);
            if is_new && generated && value.is_null() {
                continue;
            }
            values.push((schema.column_of(field).to_string(), value.clone()));
        }

        let result = if is_new {
            try_outcome!(self.storage.insert(cx, &schema, &values).await)
        } else {
            let filter = record.where_identity(true);
            let mut next_version = None;
            if let Some(version) = schema.version_field() {
                let current = record.get_data_value(version).cloned().unwrap_or(Value::Int(0));
                let current = if current.is_null() { Value::Int(0) } else { current };
                let next = try_result!(current.add_delta(1));
                let column = schema.column_of(version).to_string();
                values.retain(|(c, _)| *c != column);
                values.push((column, next.clone()));
                next_version = Some((version, next));
            }
            let result = try_outcome!(self.storage.update(cx, &schema, &values, &filter).await);
            if result.rows_affected == 0 && next_version.is_some() {
                tracing::debug!(entity = %schema.name(), "Versioned update matched no row");
                return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                    entity: schema.name().to_string(),
                    filter,
                    values,
                }));
            }
            if let Some((version, next)) = next_version {
                try_result!(record.set_with(version, next, SetOptions::RAW));
            }
            result
        };

        for (column, value) in result.returned {
            let field = schema.field_of(&column).to_string();
            let listed = real_fields.contains(&field);
            if listed || record.get_data_value(&field).is_none_or(Value::is_null) {
                try_result!(record.set_with(&field, value, SetOptions::RAW));
            }
        }
        tracing::debug!(entity = %schema.name(), fields = real_fields.len(), inserted = is_new, "Record written");
        Outcome::Ok(Some(real_fields))
    }

    /// Save attached belongs-to parents and point the record at them.
    async fn save_parents(&self, cx: &Cx, record: &mut Record, options: &SaveOptions) -> Outcome<(), Error> {
        let includes: Vec<AttachedInclude> = record
            .include()
            .iter()
            .filter(|i| i.association.kind == AssociationKind::ManyToOne)
            .cloned()
            .collect();
        for include in includes {
            let Some(mut related) = record.take_related(&include.alias) else {
                continue;
            };
            let mut outcome = Outcome::Ok(());
            if let Related::One(Some(parent)) = &mut related {
                outcome = self.save_boxed(cx, parent, options.nested()).await;
                if matches!(outcome, Outcome::Ok(())) {
                    let key = parent.get(include.association.target_key_name());
                    if let Err(e) = record.set_with(&include.association.foreign_key, key, SetOptions::RAW) {
                        outcome = Outcome::Err(e);
                    }
                }
            }
            record.set_related(include.alias.clone(), related);
            try_outcome!(outcome);
        }
        Outcome::Ok(())
    }

    /// Save attached has-one, has-many and many-to-many records of a
    /// freshly inserted record.
    async fn save_children(&self, cx: &Cx, record: &mut Record, options: &SaveOptions) -> Outcome<(), Error> {
        let includes: Vec<AttachedInclude> = record
            .include()
            .iter()
            .filter(|i| i.association.kind != AssociationKind::ManyToOne)
            .cloned()
            .collect();
        for include in includes {
            let Some(mut related) = record.take_related(&include.alias) else {
                continue;
            };
            let source = record.get(include.association.source_key_name());
            let outcome = self.save_related(cx, &include, source, &mut related, options).await;
            record.set_related(include.alias.clone(), related);
            try_outcome!(outcome);
        }
        Outcome::Ok(())
    }

    async fn save_related(
        &self,
        cx: &Cx,
        include: &AttachedInclude,
        source: Value,
        related: &mut Related,
        options: &SaveOptions,
    ) -> Outcome<(), Error> {
        let association = &include.association;
        let scope_values = association.scope.as_ref().map(equality_pairs).unwrap_or_default();
        for child in related.records_mut() {
            for (field, value) in &scope_values {
                try_result!(child.set(field, value.clone()));
            }
            let Some(through) = &association.through else {
                try_result!(child.set_with(&association.foreign_key, source.clone(), SetOptions::RAW));
                try_outcome!(self.save_boxed(cx, child, options.nested()).await);
                continue;
            };

            try_outcome!(self.save_boxed(cx, child, options.nested()).await);
            let mut values = vec![
                (through.foreign_key.clone(), source.clone()),
                (through.other_key.clone(), child.get(association.target_key_name())),
            ];
            if let Some(scope) = &through.scope {
                values.extend(equality_pairs(scope));
            }
            let junction_schema = try_result!(self.registry.schema(&through.model));
            if let Some(Related::One(Some(link))) = child.related(&through.model) {
                for (field, value) in link.data_values() {
                    let taken = values.iter().any(|(f, _)| *f == field);
                    if !taken && !junction_schema.is_primary_key(&field) && !value.is_null() {
                        values.push((field, value));
                    }
                }
            }
            let mut junction = try_result!(self.build(&through.model, values));
            try_outcome!(self.save_boxed(cx, &mut junction, options.nested()).await);
            child.set_related(through.model.clone(), Related::One(Some(Box::new(junction))));
        }
        Outcome::Ok(())
    }

    /// Validate every attribute of a record, hooks included.
    pub async fn validate(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        self.validate_with(cx, record, &ValidateOptions::default(), true).await
    }

    pub(crate) async fn validate_with(
        &self,
        cx: &Cx,
        record: &mut Record,
        options: &ValidateOptions,
        hooks: bool,
    ) -> Outcome<(), Error> {
        if hooks {
            try_result!(self.run_record_hook(HookPoint::BeforeValidate, record));
        }
        try_outcome!(self.validator.validate(cx, record, options).await);
        if hooks {
            try_result!(self.run_record_hook(HookPoint::AfterValidate, record));
        }
        Outcome::Ok(())
    }

    pub(crate) fn run_record_hook(&self, point: HookPoint, record: &mut Record) -> Result<()> {
        let entity = record.entity().to_string();
        self.hooks.run(&entity, point, &mut HookArgs::Record(record))
    }

    /// Delete a record, or stamp its deletion time when the entity is
    /// paranoid and `force` is not set.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %record.entity()))]
    pub async fn destroy(&self, cx: &Cx, record: &mut Record, options: &DestroyOptions) -> Outcome<(), Error> {
        let schema = Arc::clone(record.schema());
        if options.hooks {
            try_result!(self.run_record_hook(HookPoint::BeforeDestroy, record));
        }

        match schema.deleted_at() {
            Some(deleted_at) if !options.force => {
                let stamp = Value::Timestamp(self.config.now());
                try_outcome!(self.save_deleted_at(cx, record, deleted_at, stamp).await);
            }
            _ => {
                if let Some(reason) = cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                let filter = record.where_identity(true);
                let deleted = try_outcome!(self.storage.delete(cx, &schema, &filter).await);
                if deleted == 0 && schema.version_field().is_some() {
                    return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                        entity: schema.name().to_string(),
                        filter,
                        values: Vec::new(),
                    }));
                }
                tracing::debug!(entity = %schema.name(), deleted, "Record deleted");
            }
        }

        if options.hooks {
            try_result!(self.run_record_hook(HookPoint::AfterDestroy, record));
        }
        Outcome::Ok(())
    }

    /// Undo a soft delete.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %record.entity()))]
    pub async fn restore(&self, cx: &Cx, record: &mut Record, options: &DestroyOptions) -> Outcome<(), Error> {
        let schema = Arc::clone(record.schema());
        let Some(deleted_at) = schema.deleted_at() else {
            return Outcome::Err(Error::NotParanoid(NotParanoidError {
                entity: schema.name().to_string(),
                operation: "restore",
            }));
        };
        if options.hooks {
            try_result!(self.run_record_hook(HookPoint::BeforeRestore, record));
        }
        let cleared = schema
            .default_for(deleted_at)
            .map_or(Value::Null, |d| d.resolve(self.config.now()));
        try_outcome!(self.save_deleted_at(cx, record, deleted_at, cleared).await);
        if options.hooks {
            try_result!(self.run_record_hook(HookPoint::AfterRestore, record));
        }
        Outcome::Ok(())
    }

    /// Write a new deletion timestamp, leaving the record as it was when
    /// the save does not go through.
    async fn save_deleted_at(
        &self,
        cx: &Cx,
        record: &mut Record,
        deleted_at: &str,
        value: Value,
    ) -> Outcome<(), Error> {
        let checkpoint = record.checkpoint();
        record.set_data_value(deleted_at, value);
        let save = SaveOptions::new().hooks(false);
        match self.save_record(cx, record, &save, true).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => {
                record.rollback(checkpoint);
                Outcome::Err(e)
            }
            Outcome::Cancelled(reason) => {
                record.rollback(checkpoint);
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(payload) => {
                record.rollback(checkpoint);
                Outcome::Panicked(payload)
            }
        }
    }

    /// Re-read a record by primary key with its include plan, discarding
    /// unsaved changes.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %record.entity()))]
    pub async fn reload(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        let schema = Arc::clone(record.schema());
        let options = FindOptions {
            filter: Some(record.where_identity(false)),
            include: record.include().iter().map(include_request).collect(),
            paranoid: false,
            ..FindOptions::default()
        };
        let view = ScopedView::new(Arc::clone(&schema));
        let Some(mut fresh) = try_outcome!(self.find_one(cx, &view, options).await) else {
            return Outcome::Err(Error::EmptyResult(EmptyResultError {
                entity: schema.name().to_string(),
            }));
        };

        for (field, value) in fresh.data_values() {
            try_result!(record.set_with(&field, value, SetOptions::RAW));
        }
        record.commit_all();
        let aliases: Vec<String> = fresh.related_aliases().map(str::to_string).collect();
        for alias in aliases {
            if let Some(related) = fresh.take_related(&alias) {
                record.set_related(alias, related);
            }
        }
        record.mark_persisted();
        Outcome::Ok(())
    }

    /// Atomically add to numeric attributes in storage and mirror the
    /// result on the record.
    ///
    /// The update timestamp is touched and the version, when the entity
    /// has one, is bumped by one. A row that no longer exists is
    /// `EmptyResult` and the record is left untouched.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %record.entity()))]
    pub async fn increment(&self, cx: &Cx, record: &mut Record, by: &[(&str, i64)]) -> Outcome<(), Error> {
        let schema = Arc::clone(record.schema());
        if by.is_empty() {
            return Outcome::Ok(());
        }
        for (field, _) in by {
            if !schema.has_attribute(field) {
                return Outcome::Err(Error::request(format!(
                    "Unknown attribute {field} on {}",
                    schema.name()
                )));
            }
        }

        let now = self.config.now();
        let mut deltas: Vec<(String, i64)> = by
            .iter()
            .map(|(field, delta)| (schema.column_of(field).to_string(), *delta))
            .collect();
        let version = schema.version_field().filter(|v| !by.iter().any(|(f, _)| f == v));
        if let Some(version) = version {
            deltas.push((schema.column_of(version).to_string(), 1));
        }
        let mut extra = Vec::new();
        if let Some(updated_at) = schema.updated_at() {
            extra.push((schema.column_of(updated_at).to_string(), Value::Timestamp(now)));
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let filter = record.where_identity(false);
        let affected = try_outcome!(self.storage.increment(cx, &schema, &deltas, &extra, &filter).await);
        if affected == 0 {
            return Outcome::Err(Error::EmptyResult(EmptyResultError {
                entity: schema.name().to_string(),
            }));
        }
        tracing::debug!(entity = %schema.name(), affected, "Incremented");

        let mut applied: Vec<(&str, i64)> = by.to_vec();
        if let Some(version) = version {
            applied.push((version, 1));
        }
        for (field, delta) in applied {
            let current = record.get_data_value(field).cloned().unwrap_or(Value::Null);
            let next = try_result!(current.add_delta(delta));
            try_result!(record.set_with(field, next, SetOptions::RAW));
        }
        if let Some(updated_at) = schema.updated_at() {
            try_result!(record.set_with(updated_at, Value::Timestamp(now), SetOptions::RAW));
        }
        Outcome::Ok(())
    }

    /// [`increment`](Self::increment) with every amount negated.
    pub async fn decrement(&self, cx: &Cx, record: &mut Record, by: &[(&str, i64)]) -> Outcome<(), Error> {
        let negated: Vec<(&str, i64)> = by.iter().map(|(f, d)| (*f, d.saturating_neg())).collect();
        self.increment(cx, record, &negated).await
    }
}

/// Attributes a save writes before hooks get a say.
fn write_set(schema: &Schema, record: &Record, options: &SaveOptions) -> Vec<String> {
    let mut fields: Vec<String> = match &options.fields {
        Some(fields) => fields.iter().filter(|f| schema.has_attribute(f)).cloned().collect(),
        None if record.is_new() => schema.field_names(),
        None => record.changed(),
    };
    if !fields.is_empty() {
        for managed in [schema.updated_at(), schema.version_field()].into_iter().flatten() {
            if !fields.iter().any(|f| f == managed) {
                fields.push(managed.to_string());
            }
        }
    }
    if record.is_new() {
        if let Some(created_at) = schema.created_at() {
            if !fields.iter().any(|f| f == created_at) {
                fields.push(created_at.to_string());
            }
        }
    }
    fields
}

/// Attributes of the schema not in `fields`.
pub(crate) fn unlisted(schema: &Schema, fields: &[String]) -> Vec<String> {
    schema
        .field_names()
        .into_iter()
        .filter(|f| !fields.contains(f))
        .collect()
}

/// Fields the before hooks changed that the save would not otherwise
/// write. Fields already dirty before the hooks ran and left out of the
/// write set stay out.
fn hook_changed(
    record: &Record,
    before: &[(String, Value)],
    changed_before: &[String],
    fields: &[String],
    updated_at: Option<&str>,
) -> Vec<String> {
    let ignored: Vec<&String> = changed_before
        .iter()
        .filter(|f| !fields.contains(f) && Some(f.as_str()) != updated_at)
        .collect();
    record
        .changed()
        .into_iter()
        .filter(|f| !ignored.contains(&f))
        .filter(|f| {
            let previous = before.iter().find(|(k, _)| k == f).map(|(_, v)| v);
            previous != record.get_data_value(f)
        })
        .collect()
}

fn include_request(include: &AttachedInclude) -> IncludeRequest {
    let mut options = IncludeOptions::association(Arc::clone(&include.association));
    for child in &include.include {
        options = options.include(include_request(child));
    }
    options.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{Association, AttributeDef, DataType, SchemaOptions, Through};

    use crate::hooks::hook_error;
    use crate::memory::MemoryStorage;
    use crate::validator::FieldRule;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    fn fixed_clock() -> i64 {
        1_700_000_000_000_000
    }

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::builder()
                .define(
                    "Team",
                    vec![AttributeDef::new("name", DataType::Text).not_null().unique()],
                    SchemaOptions::new(),
                )
                .and_then(|b| {
                    b.define(
                        "Player",
                        vec![
                            AttributeDef::new("name", DataType::Text).not_null(),
                            AttributeDef::new("team_id", DataType::Integer),
                            AttributeDef::new("score", DataType::Integer).default_value(0),
                        ],
                        SchemaOptions::new().versioned(),
                    )
                })
                .and_then(|b| {
                    b.define(
                        "Note",
                        vec![AttributeDef::new("body", DataType::Text)],
                        SchemaOptions::new().paranoid(true),
                    )
                })
                .and_then(|b| {
                    b.define(
                        "Memo",
                        vec![AttributeDef::new("body", DataType::Text)],
                        SchemaOptions::new().paranoid(true).versioned(),
                    )
                })
                .and_then(|b| {
                    b.define(
                        "Skill",
                        vec![AttributeDef::new("label", DataType::Text)],
                        SchemaOptions::new().timestamps(false),
                    )
                })
                .and_then(|b| {
                    b.define(
                        "PlayerSkill",
                        vec![
                            AttributeDef::new("player_id", DataType::Integer),
                            AttributeDef::new("skill_id", DataType::Integer),
                            AttributeDef::new("level", DataType::Integer),
                        ],
                        SchemaOptions::new().timestamps(false),
                    )
                })
                .map(|b| {
                    b.associate(Association::has_many("Team", "Player", "team_id").alias("players"))
                        .associate(Association::belongs_to("Player", "Team", "team_id").alias("team"))
                        .associate(
                            Association::belongs_to_many(
                                "Player",
                                "Skill",
                                Through::new("PlayerSkill", "player_id", "skill_id"),
                            )
                            .alias("skills"),
                        )
                })
                .and_then(|b| b.build())
                .expect("registry"),
        )
    }

    fn coordinator() -> PersistenceCoordinator<MemoryStorage> {
        let registry = registry();
        PersistenceCoordinator::new(Arc::clone(&registry), MemoryStorage::new(registry))
            .with_config(PersistConfig::new().clock(fixed_clock))
    }

    #[test]
    fn test_create_assigns_id_and_timestamps() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let team = unwrap_outcome(
                coordinator
                    .create(&cx, "Team", [("name", "reds")], &SaveOptions::new())
                    .await,
            );
            assert!(!team.is_new());
            assert!(!team.has_changes());
            assert_eq!(team.get("id"), Value::BigInt(1));
            assert_eq!(team.get("created_at"), Value::Timestamp(fixed_clock()));
            assert_eq!(team.get("updated_at"), Value::Timestamp(fixed_clock()));
            assert_eq!(coordinator.storage().writes(), 1);
        });
    }

    #[test]
    fn test_second_save_without_changes_skips_storage() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut team = coordinator.build("Team", [("name", "reds")]).expect("build");
            unwrap_outcome(coordinator.save(&cx, &mut team, &SaveOptions::new()).await);
            unwrap_outcome(coordinator.save(&cx, &mut team, &SaveOptions::new()).await);
            assert_eq!(coordinator.storage().writes(), 1);

            team.set("name", "blues").expect("set");
            unwrap_outcome(coordinator.save(&cx, &mut team, &SaveOptions::new()).await);
            assert_eq!(coordinator.storage().writes(), 2);
            assert!(!team.has_changes());
        });
    }

    #[test]
    fn test_validation_failure_leaves_record_untouched() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut player = coordinator.build("Player", [("score", 3)]).expect("build");
            let err = unwrap_err(coordinator.save(&cx, &mut player, &SaveOptions::new()).await);
            assert!(matches!(err, Error::Validation(ref v) if v.fields() == vec!["name"]));
            assert!(player.is_new());
            assert_eq!(coordinator.storage().writes(), 0);
        });
    }

    #[test]
    fn test_custom_rules_run_through_validator() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let registry = registry();
            let validator = RuleValidator::new().rule("Team", "name", FieldRule::Length { min: Some(3), max: None });
            let coordinator = PersistenceCoordinator::with_validator(
                Arc::clone(&registry),
                MemoryStorage::new(registry),
                validator,
            );
            let err = unwrap_err(coordinator.create(&cx, "Team", [("name", "x")], &SaveOptions::new()).await);
            assert!(matches!(err, Error::Validation(_)));

            let skipped = SaveOptions::new().validate(false);
            let team = unwrap_outcome(coordinator.create(&cx, "Team", [("name", "x")], &skipped).await);
            assert!(!team.is_new());
        });
    }

    #[test]
    fn test_before_save_hook_changes_join_write_set() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            coordinator.hooks_mut().add("Player", HookPoint::BeforeUpdate, |args| {
                let record = args.record().expect("record");
                record.set("score", 99)
            });
            let mut player = unwrap_outcome(
                coordinator
                    .create(&cx, "Player", [("name", "ann")], &SaveOptions::new())
                    .await,
            );
            unwrap_outcome(coordinator.update(&cx, &mut player, [("name", "anne")], &SaveOptions::new()).await);

            let rows = coordinator.storage().rows("Player").expect("rows");
            assert_eq!(rows[0].get_by_name("score"), Some(&Value::BigInt(99)));
            assert_eq!(rows[0].get_by_name("name"), Some(&Value::Text("anne".into())));
            assert!(!player.has_changes());
        });
    }

    #[test]
    fn test_hook_error_aborts_before_storage() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            coordinator.hooks_mut().add("Team", HookPoint::BeforeCreate, |_| {
                Err(hook_error(HookPoint::BeforeCreate, "teams are closed"))
            });
            let mut team = coordinator.build("Team", [("name", "reds")]).expect("build");
            let err = unwrap_err(coordinator.save(&cx, &mut team, &SaveOptions::new()).await);
            assert!(matches!(err, Error::Hook(ref h) if h.hook == "beforeCreate"));
            assert!(team.is_new());
            assert_eq!(coordinator.storage().writes(), 0);
        });
    }

    #[test]
    fn test_after_hooks_run_in_order() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut coordinator = coordinator();
            let calls = Arc::new(AtomicUsize::new(0));
            let create_calls = Arc::clone(&calls);
            coordinator.hooks_mut().add("Team", HookPoint::AfterCreate, move |args| {
                assert!(args.record().expect("record").get("id").as_i64().is_some());
                assert_eq!(create_calls.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            });
            let save_calls = Arc::clone(&calls);
            coordinator.hooks_mut().add("Team", HookPoint::AfterSave, move |_| {
                assert_eq!(save_calls.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            });
            unwrap_outcome(coordinator.create(&cx, "Team", [("name", "reds")], &SaveOptions::new()).await);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_stale_version_is_an_optimistic_lock_conflict() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut player = unwrap_outcome(
                coordinator
                    .create(&cx, "Player", [("name", "ann")], &SaveOptions::new())
                    .await,
            );
            assert_eq!(player.get("version").as_i64(), Some(0));

            let mut other = player.clone();
            other.set("score", 5).expect("set");
            unwrap_outcome(coordinator.save(&cx, &mut other, &SaveOptions::new()).await);
            assert_eq!(other.get("version").as_i64(), Some(1));

            player.set("score", 7).expect("set");
            let err = unwrap_err(coordinator.save(&cx, &mut player, &SaveOptions::new()).await);
            assert!(matches!(err, Error::OptimisticLock(ref e) if e.entity == "Player"));
            assert!(!player.is_new());
            assert_eq!(player.changed(), vec!["score".to_string()]);
            assert_eq!(player.get("version").as_i64(), Some(0));
        });
    }

    #[test]
    fn test_nested_create_cascades_both_directions() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut player = coordinator
                .build_with_include(
                    "Player",
                    [
                        ("name", Value::from("ann")),
                        ("team", Value::Json(serde_json::json!({"name": "reds"}))),
                        (
                            "skills",
                            Value::Json(serde_json::json!([
                                {"label": "speed"},
                                {"label": "aim"}
                            ])),
                        ),
                    ],
                    vec!["team".into(), "skills".into()],
                )
                .expect("build");
            unwrap_outcome(coordinator.save(&cx, &mut player, &SaveOptions::new()).await);

            assert_eq!(player.get("team_id"), Value::BigInt(1));
            let links = coordinator.storage().rows("PlayerSkill").expect("rows");
            assert_eq!(links.len(), 2);
            assert_eq!(links[0].get_by_name("player_id"), Some(&Value::BigInt(1)));
            assert_eq!(links[1].get_by_name("skill_id"), Some(&Value::BigInt(2)));
            let skills = player.related("skills").expect("skills").records();
            assert!(skills.iter().all(|s| !s.is_new()));
        });
    }

    #[test]
    fn test_has_many_children_get_parent_key() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let players = Value::Json(serde_json::json!([{"name": "ann"}, {"name": "bob"}]));
            let mut team = coordinator
                .build_with_include(
                    "Team",
                    [("name", Value::from("reds")), ("players", players)],
                    vec!["players".into()],
                )
                .expect("build");
            unwrap_outcome(coordinator.save(&cx, &mut team, &SaveOptions::new()).await);
            let rows = coordinator.storage().rows("Player").expect("rows");
            assert_eq!(rows.len(), 2);
            assert!(rows.iter().all(|r| r.get_by_name("team_id") == Some(&Value::BigInt(1))));
        });
    }

    #[test]
    fn test_soft_destroy_and_restore() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut note = unwrap_outcome(
                coordinator
                    .create(&cx, "Note", [("body", "hi")], &SaveOptions::new())
                    .await,
            );
            unwrap_outcome(coordinator.destroy(&cx, &mut note, &DestroyOptions::new()).await);
            assert!(note.is_soft_deleted());
            assert_eq!(coordinator.storage().rows("Note").expect("rows").len(), 1);

            unwrap_outcome(coordinator.restore(&cx, &mut note, &DestroyOptions::new()).await);
            assert!(!note.is_soft_deleted());

            unwrap_outcome(coordinator.destroy(&cx, &mut note, &DestroyOptions::new().force(true)).await);
            assert!(coordinator.storage().rows("Note").expect("rows").is_empty());
        });
    }

    #[test]
    fn test_failed_soft_destroy_leaves_record_live() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut memo = unwrap_outcome(
                coordinator
                    .create(&cx, "Memo", [("body", "draft")], &SaveOptions::new())
                    .await,
            );
            let mut other = memo.clone();
            other.set("body", "final").expect("set");
            unwrap_outcome(coordinator.save(&cx, &mut other, &SaveOptions::new()).await);

            let err = unwrap_err(coordinator.destroy(&cx, &mut memo, &DestroyOptions::new()).await);
            assert!(matches!(err, Error::OptimisticLock(ref e) if e.entity == "Memo"));
            assert!(!memo.is_soft_deleted());
            assert!(memo.changed().is_empty());
            assert_eq!(memo.get("version").as_i64(), Some(0));

            let rows = coordinator.storage().rows("Memo").expect("rows");
            assert_eq!(rows[0].get_by_name("deleted_at"), Some(&Value::Null));
        });
    }

    #[test]
    fn test_failed_restore_keeps_deletion_stamp() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut memo = unwrap_outcome(
                coordinator
                    .create(&cx, "Memo", [("body", "draft")], &SaveOptions::new())
                    .await,
            );
            unwrap_outcome(coordinator.destroy(&cx, &mut memo, &DestroyOptions::new()).await);
            assert!(memo.is_soft_deleted());

            let mut other = memo.clone();
            unwrap_outcome(coordinator.restore(&cx, &mut other, &DestroyOptions::new()).await);
            assert!(!other.is_soft_deleted());

            let err = unwrap_err(coordinator.restore(&cx, &mut memo, &DestroyOptions::new()).await);
            assert!(matches!(err, Error::OptimisticLock(_)));
            assert!(memo.is_soft_deleted());
            assert!(memo.changed().is_empty());
        });
    }

    #[test]
    fn test_restore_requires_paranoid_entity() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut team = unwrap_outcome(coordinator.create(&cx, "Team", [("name", "reds")], &SaveOptions::new()).await);
            let err = unwrap_err(coordinator.restore(&cx, &mut team, &DestroyOptions::new()).await);
            assert!(matches!(err, Error::NotParanoid(ref e) if e.operation == "restore"));
        });
    }

    #[test]
    fn test_reload_discards_unsaved_changes() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut team = unwrap_outcome(coordinator.create(&cx, "Team", [("name", "reds")], &SaveOptions::new()).await);
            team.set("name", "blues").expect("set");
            unwrap_outcome(coordinator.reload(&cx, &mut team).await);
            assert_eq!(team.get("name"), Value::Text("reds".into()));
            assert!(!team.has_changes());

            unwrap_outcome(coordinator.destroy(&cx, &mut team, &DestroyOptions::new()).await);
            let err = unwrap_err(coordinator.reload(&cx, &mut team).await);
            assert!(matches!(err, Error::EmptyResult(_)));
        });
    }

    #[test]
    fn test_increment_and_decrement() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut player = unwrap_outcome(
                coordinator
                    .create(&cx, "Player", [("name", "ann")], &SaveOptions::new())
                    .await,
            );
            unwrap_outcome(coordinator.increment(&cx, &mut player, &[("score", 5)]).await);
            unwrap_outcome(coordinator.decrement(&cx, &mut player, &[("score", 2)]).await);
            assert_eq!(player.get("score").as_i64(), Some(3));
            assert_eq!(player.get("version").as_i64(), Some(2));
            assert!(!player.has_changes());

            let rows = coordinator.storage().rows("Player").expect("rows");
            assert_eq!(rows[0].get_by_name("score").and_then(Value::as_i64), Some(3));
            assert_eq!(rows[0].get_by_name("version").and_then(Value::as_i64), Some(2));

            let err = unwrap_err(coordinator.increment(&cx, &mut player, &[("bogus", 1)]).await);
            assert!(matches!(err, Error::Request(_)));
        });
    }

    #[test]
    fn test_increment_of_missing_row_leaves_record_untouched() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let coordinator = coordinator();
            let mut player = unwrap_outcome(
                coordinator
                    .create(&cx, "Player", [("name", "ann")], &SaveOptions::new())
                    .await,
            );
            let mut other = player.clone();
            unwrap_outcome(coordinator.destroy(&cx, &mut other, &DestroyOptions::new()).await);

            let err = unwrap_err(coordinator.increment(&cx, &mut player, &[("score", 5)]).await);
            assert!(matches!(err, Error::EmptyResult(ref e) if e.entity == "Player"));
            assert_eq!(player.get("score").as_i64(), Some(0));
            assert_eq!(player.get("version").as_i64(), Some(0));
            assert!(!player.has_changes());
        });
    }
}
