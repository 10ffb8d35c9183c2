//! In-process storage backend.
//!
//! Tables are vectors of column-keyed rows behind a mutex. Planned selects
//! are executed the way a relational store would run the joined query:
//! root rows are filtered, narrowed by required includes, ordered and
//! paged, then expanded into one flat row per join combination with
//! include columns prefixed by their alias path.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::{Future, ready};
use std::sync::{Arc, Mutex};

use asupersync::{Cx, Outcome};
use relmap_core::{
    AssociationKind, Error, OrderBy, Registry, Result, Row, Schema, UniqueConstraintError, Value,
    Where,
};
use relmap_query::{NodeId, QueryPlan};

use crate::storage::{Aggregate, BulkInsertOptions, Storage, WriteResult};

type StoredRow = HashMap<String, Value>;

static NULL: Value = Value::Null;

#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<StoredRow>,
    last_id: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    writes: usize,
}

impl MemoryState {
    fn rows(&self, table: &str) -> &[StoredRow] {
        match self.tables.get(table) {
            Some(t) => &t.rows,
            None => &[],
        }
    }
}

/// A joined match: the target row and, for many-to-many, its junction row.
struct Match<'s> {
    row: &'s StoredRow,
    junction: Option<&'s StoredRow>,
}

/// Storage that keeps every table in memory.
#[derive(Debug)]
pub struct MemoryStorage {
    registry: Arc<Registry>,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Number of write calls (inserts, updates, deletes) served so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Stored rows of an entity in insertion order, keyed by column.
    pub fn rows(&self, entity: &str) -> Result<Vec<Row>> {
        let schema = self.registry.schema(entity)?;
        let state = self.lock();
        let fields = schema.persisted_fields();
        Ok(state
            .rows(schema.table())
            .iter()
            .map(|row| Row::from_pairs(project(schema, row, &fields, "")))
            .collect())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run<T>(&self, cx: &Cx, op: impl FnOnce(&mut MemoryState) -> Result<T>) -> Outcome<T, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let mut state = self.lock();
        match op(&mut state) {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }

    // ==================== Reads ====================

    fn select_rows(&self, state: &MemoryState, plan: &QueryPlan) -> Result<Vec<Row>> {
        let schema = self.registry.schema(&plan.model)?;
        let roots = self.root_rows(state, plan, schema, true)?;
        let mut out = Vec::new();
        for root in roots {
            let base = project(schema, root, &plan.attributes, "");
            for tail in self.expand(state, plan, plan.roots(), schema, root)? {
                let mut columns = base.clone();
                columns.extend(tail);
                out.push(Row::from_pairs(columns));
            }
        }
        tracing::trace!(model = %plan.model, rows = out.len(), "memory select");
        Ok(out)
    }

    /// Root rows after filtering, required-include narrowing, ordering and
    /// (when `page` is set) grouped limits, offset and limit.
    fn root_rows<'s>(
        &self,
        state: &'s MemoryState,
        plan: &QueryPlan,
        schema: &Schema,
        page: bool,
    ) -> Result<Vec<&'s StoredRow>> {
        let mut rows = Vec::new();
        for row in state.rows(schema.table()) {
            if matches(schema, row, plan.filter.as_ref())
                && self.satisfies_required(state, plan, plan.roots(), schema, row)?
            {
                rows.push(row);
            }
        }
        sort_rows(&mut rows, schema, &plan.order);
        if !page {
            return Ok(rows);
        }

        if let Some(grouped) = &plan.grouped_limit {
            let mut seen: Vec<(&Value, u64)> = Vec::new();
            rows.retain(|row| {
                let key = read(schema, *row, &grouped.on);
                match seen.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, count)) if *count >= grouped.limit => false,
                    Some((_, count)) => {
                        *count += 1;
                        true
                    }
                    None => {
                        seen.push((key, 1));
                        grouped.limit > 0
                    }
                }
            });
        }

        let offset = usize::try_from(plan.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = plan
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn satisfies_required(
        &self,
        state: &MemoryState,
        plan: &QueryPlan,
        nodes: &[NodeId],
        parent_schema: &Schema,
        parent: &StoredRow,
    ) -> Result<bool> {
        for id in nodes {
            let node = plan.node(*id);
            if node.pseudo || node.separate || !node.required {
                continue;
            }
            if self.matches_for(state, plan, *id, parent_schema, parent)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rows of a node's entity joined to `parent`, with the node's filter and
    /// its own required children applied.
    fn matches_for<'s>(
        &self,
        state: &'s MemoryState,
        plan: &QueryPlan,
        id: NodeId,
        parent_schema: &Schema,
        parent: &StoredRow,
    ) -> Result<Vec<Match<'s>>> {
        let node = plan.node(id);
        let assoc = &node.association;
        let target = self.registry.schema(&node.model)?;
        let mut found = Vec::new();

        let mut accept = |row: &'s StoredRow, junction: Option<&'s StoredRow>| -> Result<()> {
            if matches(target, row, node.filter.as_ref())
                && self.satisfies_required(state, plan, &node.children, target, row)?
            {
                found.push(Match { row, junction });
            }
            Ok(())
        };

        match assoc.kind {
            AssociationKind::ManyToOne => {
                let key = read(parent_schema, parent, &assoc.foreign_key);
                for row in state.rows(target.table()) {
                    if read(target, row, assoc.target_key_name()).sql_eq(key) {
                        accept(row, None)?;
                    }
                }
            }
            AssociationKind::OneToOne | AssociationKind::OneToMany => {
                let key = read(parent_schema, parent, assoc.source_key_name());
                for row in state.rows(target.table()) {
                    if read(target, row, &assoc.foreign_key).sql_eq(key) {
                        accept(row, None)?;
                    }
                }
            }
            AssociationKind::ManyToMany => {
                let Some(through) = assoc.through.as_ref() else {
                    return Ok(Vec::new());
                };
                let junction = self.registry.schema(&through.model)?;
                let junction_filter = plan
                    .children(id)
                    .find(|c| c.pseudo)
                    .and_then(|c| c.filter.as_ref());
                let key = read(parent_schema, parent, assoc.source_key_name());
                for link in state.rows(junction.table()) {
                    if !read(junction, link, &through.foreign_key).sql_eq(key)
                        || !matches(junction, link, junction_filter)
                    {
                        continue;
                    }
                    let other = read(junction, link, &through.other_key);
                    for row in state.rows(target.table()) {
                        if read(target, row, assoc.target_key_name()).sql_eq(other) {
                            accept(row, Some(link))?;
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    /// Join combinations of `nodes` under one parent row, as prefixed columns.
    fn expand(
        &self,
        state: &MemoryState,
        plan: &QueryPlan,
        nodes: &[NodeId],
        parent_schema: &Schema,
        parent: &StoredRow,
    ) -> Result<Vec<Vec<(String, Value)>>> {
        let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
        for id in nodes {
            let node = plan.node(*id);
            if node.pseudo || node.separate {
                continue;
            }
            let target = self.registry.schema(&node.model)?;
            let prefix = plan.prefix(*id);
            let pseudo = plan.children(*id).find(|c| c.pseudo);

            let mut branches = Vec::new();
            let matched = self.matches_for(state, plan, *id, parent_schema, parent)?;
            if matched.is_empty() {
                branches.push(self.null_columns(plan, *id)?);
            }
            for m in matched {
                let mut own = project(target, m.row, &node.attributes, &prefix);
                if let (Some(link), Some(pseudo)) = (m.junction, pseudo) {
                    let junction = self.registry.schema(&pseudo.model)?;
                    own.extend(project(junction, link, &pseudo.attributes, &plan.prefix(pseudo.id)));
                }
                for tail in self.expand(state, plan, &node.children, target, m.row)? {
                    let mut branch = own.clone();
                    branch.extend(tail);
                    branches.push(branch);
                }
            }

            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    branches.iter().map(move |branch| {
                        let mut next = combo.clone();
                        next.extend(branch.iter().cloned());
                        next
                    })
                })
                .collect();
        }
        Ok(combos)
    }

    /// NULL columns for an unmatched outer join of `id` and its joined subtree.
    fn null_columns(&self, plan: &QueryPlan, id: NodeId) -> Result<Vec<(String, Value)>> {
        let node = plan.node(id);
        let schema = self.registry.schema(&node.model)?;
        let prefix = plan.prefix(id);
        let fields = if node.attributes.is_empty() {
            schema.persisted_fields()
        } else {
            node.attributes.clone()
        };
        let mut out: Vec<(String, Value)> = fields
            .iter()
            .map(|f| (format!("{prefix}.{}", schema.column_of(f)), Value::Null))
            .collect();
        for child in &node.children {
            if !plan.node(*child).separate {
                out.extend(self.null_columns(plan, *child)?);
            }
        }
        Ok(out)
    }

    fn count_rows(&self, state: &MemoryState, plan: &QueryPlan) -> Result<u64> {
        let schema = self.registry.schema(&plan.model)?;
        let rows = self.root_rows(state, plan, schema, false)?;
        Ok(rows.len() as u64)
    }

    fn aggregate_rows(
        &self,
        state: &MemoryState,
        plan: &QueryPlan,
        function: Aggregate,
        field: &str,
    ) -> Result<Value> {
        let schema = self.registry.schema(&plan.model)?;
        let rows = self.root_rows(state, plan, schema, false)?;
        let values: Vec<&Value> = rows
            .iter()
            .map(|row| read(schema, row, field))
            .filter(|v| !v.is_null())
            .collect();
        let result = match function {
            Aggregate::Count => Value::BigInt(i64::try_from(values.len()).unwrap_or(i64::MAX)),
            _ if values.is_empty() => Value::Null,
            Aggregate::Min => values
                .iter()
                .copied()
                .min_by(|a, b| compare(a, b))
                .cloned()
                .unwrap_or(Value::Null),
            Aggregate::Max => values
                .iter()
                .copied()
                .max_by(|a, b| compare(a, b))
                .cloned()
                .unwrap_or(Value::Null),
            Aggregate::Sum => {
                if values.iter().all(|v| matches!(v, Value::Int(_) | Value::BigInt(_))) {
                    Value::BigInt(values.iter().filter_map(|v| v.as_i64()).sum())
                } else {
                    Value::Double(values.iter().filter_map(|v| v.as_f64()).sum())
                }
            }
            Aggregate::Avg => {
                let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
                Value::Double(sum / values.len() as f64)
            }
        };
        Ok(result)
    }

    // ==================== Writes ====================

    fn insert_row(state: &mut MemoryState, schema: &Schema, values: &[(String, Value)]) -> Result<WriteResult> {
        state.writes += 1;
        let table = state.tables.entry(schema.table().to_string()).or_default();
        let row = prepare_row(schema, table, values);
        check_unique(schema, &table.rows, &row, None)?;
        table.rows.push(row.clone());
        Ok(WriteResult {
            rows_affected: 1,
            returned: project(schema, &row, &[], ""),
        })
    }

    fn update_rows(
        state: &mut MemoryState,
        schema: &Schema,
        values: &[(String, Value)],
        filter: &Where,
    ) -> Result<WriteResult> {
        state.writes += 1;
        let Some(table) = state.tables.get_mut(schema.table()) else {
            return Ok(WriteResult::default());
        };
        let mut result = WriteResult::default();
        for index in 0..table.rows.len() {
            if !matches(schema, &table.rows[index], Some(filter)) {
                continue;
            }
            let mut updated = table.rows[index].clone();
            for (column, value) in values {
                updated.insert(column.clone(), value.clone());
            }
            check_unique(schema, &table.rows, &updated, Some(index))?;
            result.returned = project(schema, &updated, &[], "");
            result.rows_affected += 1;
            table.rows[index] = updated;
        }
        Ok(result)
    }

    fn delete_rows(state: &mut MemoryState, schema: &Schema, filter: &Where) -> u64 {
        state.writes += 1;
        let Some(table) = state.tables.get_mut(schema.table()) else {
            return 0;
        };
        let before = table.rows.len();
        table.rows.retain(|row| !matches(schema, row, Some(filter)));
        (before - table.rows.len()) as u64
    }

    fn increment_rows(
        state: &mut MemoryState,
        schema: &Schema,
        deltas: &[(String, i64)],
        extra: &[(String, Value)],
        filter: &Where,
    ) -> Result<u64> {
        state.writes += 1;
        let Some(table) = state.tables.get_mut(schema.table()) else {
            return Ok(0);
        };
        let mut affected = 0;
        for row in &mut table.rows {
            if !matches(schema, row, Some(filter)) {
                continue;
            }
            for (column, delta) in deltas {
                let next = row.get(column).unwrap_or(&NULL).add_delta(*delta)?;
                row.insert(column.clone(), next);
            }
            for (column, value) in extra {
                row.insert(column.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }
}

impl Storage for MemoryStorage {
    fn select(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        ready(self.run(cx, |state| self.select_rows(state, plan)))
    }

    fn count(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        _distinct: bool,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        // Root rows are never duplicated here, so distinct and plain counts agree.
        ready(self.run(cx, |state| self.count_rows(state, plan)))
    }

    fn aggregate(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        function: Aggregate,
        field: &str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        ready(self.run(cx, |state| self.aggregate_rows(state, plan, function, field)))
    }

    fn insert(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        tracing::trace!(table = schema.table(), columns = values.len(), "memory insert");
        ready(self.run(cx, |state| Self::insert_row(state, schema, values)))
    }

    fn update(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        tracing::trace!(table = schema.table(), columns = values.len(), "memory update");
        ready(self.run(cx, |state| Self::update_rows(state, schema, values, filter)))
    }

    fn delete(
        &self,
        cx: &Cx,
        schema: &Schema,
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.run(cx, |state| Ok(Self::delete_rows(state, schema, filter))))
    }

    fn bulk_insert(
        &self,
        cx: &Cx,
        schema: &Schema,
        rows: &[Vec<(String, Value)>],
        options: BulkInsertOptions,
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, Error>> + Send {
        ready(self.run(cx, |state| {
            state.writes += 1;
            let table = state.tables.entry(schema.table().to_string()).or_default();
            let mut staged = table.clone();
            let mut results = Vec::with_capacity(rows.len());
            for values in rows {
                let row = prepare_row(schema, &mut staged, values);
                match check_unique(schema, &staged.rows, &row, None) {
                    Ok(()) => {}
                    Err(e) if options.ignore_duplicates && e.is_unique_violation() => {
                        results.push(WriteResult::default());
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                results.push(WriteResult {
                    rows_affected: 1,
                    returned: project(schema, &row, &[], ""),
                });
                staged.rows.push(row);
            }
            *table = staged;
            Ok(results)
        }))
    }

    fn bulk_update(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.run(cx, |state| {
            Self::update_rows(state, schema, values, filter).map(|r| r.rows_affected)
        }))
    }

    fn bulk_delete(
        &self,
        cx: &Cx,
        schema: &Schema,
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.run(cx, |state| Ok(Self::delete_rows(state, schema, filter))))
    }

    fn increment(
        &self,
        cx: &Cx,
        schema: &Schema,
        deltas: &[(String, i64)],
        extra: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.run(cx, |state| Self::increment_rows(state, schema, deltas, extra, filter)))
    }
}

fn read<'r>(schema: &Schema, row: &'r StoredRow, field: &str) -> &'r Value {
    row.get(schema.column_of(field)).unwrap_or(&NULL)
}

fn matches(schema: &Schema, row: &StoredRow, filter: Option<&Where>) -> bool {
    filter.is_none_or(|f| f.matches(&|field: &str| row.get(schema.column_of(field))))
}

/// Column values of `fields` (all persisted fields when empty), with
/// column names under `prefix`.
fn project(schema: &Schema, row: &StoredRow, fields: &[String], prefix: &str) -> Vec<(String, Value)> {
    let all;
    let fields = if fields.is_empty() {
        all = schema.persisted_fields();
        &all
    } else {
        fields
    };
    fields
        .iter()
        .map(|field| {
            let column = schema.column_of(field);
            let name = if prefix.is_empty() {
                column.to_string()
            } else {
                format!("{prefix}.{column}")
            };
            (name, row.get(column).cloned().unwrap_or(Value::Null))
        })
        .collect()
}

/// NULLs sort last, like an ascending ORDER BY in most stores.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.sql_cmp(b).unwrap_or(Ordering::Equal),
    }
}

fn sort_rows(rows: &mut [&StoredRow], schema: &Schema, order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for term in order {
            let ordering = compare(read(schema, a, &term.field), read(schema, b, &term.field));
            let ordering = if term.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// A full row for insertion: every persisted column present, generated
/// keys filled in.
fn prepare_row(schema: &Schema, table: &mut Table, values: &[(String, Value)]) -> StoredRow {
    let mut row: StoredRow = schema
        .persisted_fields()
        .iter()
        .map(|f| (schema.column_of(f).to_string(), Value::Null))
        .collect();
    for (column, value) in values {
        row.insert(column.clone(), value.clone());
    }
    for attr in schema.attributes().iter().filter(|a| a.auto_increment) {
        let column = attr.column.as_str();
        match row.get(column).and_then(Value::as_i64) {
            Some(id) => table.last_id = table.last_id.max(id),
            None => {
                table.last_id += 1;
                row.insert(column.to_string(), Value::BigInt(table.last_id));
            }
        }
    }
    row
}

/// Reject `candidate` if it collides with another row on the primary key or
/// any unique key. Keys with a NULL part never collide.
fn check_unique(schema: &Schema, rows: &[StoredRow], candidate: &StoredRow, skip: Option<usize>) -> Result<()> {
    let keys = std::iter::once(schema.primary_keys())
        .chain(schema.unique_keys().iter().map(|k| k.fields.as_slice()));
    for fields in keys {
        let values: Vec<&Value> = fields.iter().map(|f| read(schema, candidate, f)).collect();
        if fields.is_empty() || values.iter().any(|v| v.is_null()) {
            continue;
        }
        let collides = rows.iter().enumerate().any(|(i, row)| {
            Some(i) != skip
                && fields
                    .iter()
                    .zip(&values)
                    .all(|(f, v)| read(schema, row, f).sql_eq(v))
        });
        if collides {
            tracing::debug!(entity = schema.name(), fields = ?fields, "unique constraint violated");
            return Err(Error::UniqueConstraint(UniqueConstraintError {
                entity: schema.name().to_string(),
                fields: fields
                    .iter()
                    .zip(values)
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect(),
                message: format!("{} must be unique", fields.join(", ")),
            }));
        }
    }
    Ok(())
}
