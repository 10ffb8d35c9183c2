//! Storage collaborator interface.
//!
//! The coordinator hands storage fully resolved work: planned selects,
//! column-keyed values and field-level filters. Statement synthesis and
//! execution are the implementation's business.

use std::future::Future;

use asupersync::{Cx, Outcome};
use relmap_core::{Error, Row, Schema, Value, Where};
use relmap_query::QueryPlan;
use serde::{Deserialize, Serialize};

/// Result of a single-row write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub rows_affected: u64,
    /// Stored column values after the write, generated ones included
    pub returned: Vec<(String, Value)>,
}

impl WriteResult {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.returned
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }
}

/// Aggregate functions over one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl Aggregate {
    pub const fn as_str(self) -> &'static str {
        match self {
            Aggregate::Count => "count",
            Aggregate::Sum => "sum",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkInsertOptions {
    /// Skip rows that would violate a uniqueness constraint
    pub ignore_duplicates: bool,
}

/// A storage backend.
///
/// Values are keyed by column name; filters name attributes and are
/// resolved against the schema by the backend.
pub trait Storage: Send + Sync {
    /// Execute a planned find. Root columns are plain, include columns are
    /// prefixed with their alias path.
    fn select(&self, cx: &Cx, plan: &QueryPlan) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Count root rows of a plan, ignoring limit and offset.
    fn count(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        distinct: bool,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    fn aggregate(
        &self,
        cx: &Cx,
        plan: &QueryPlan,
        function: Aggregate,
        field: &str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;

    fn insert(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send;

    fn update(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send;

    fn delete(
        &self,
        cx: &Cx,
        schema: &Schema,
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    fn bulk_insert(
        &self,
        cx: &Cx,
        schema: &Schema,
        rows: &[Vec<(String, Value)>],
        options: BulkInsertOptions,
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, Error>> + Send;

    fn bulk_update(
        &self,
        cx: &Cx,
        schema: &Schema,
        values: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    fn bulk_delete(
        &self,
        cx: &Cx,
        schema: &Schema,
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// `column = column + delta` for every matching row, plus plain
    /// assignments in `extra`.
    fn increment(
        &self,
        cx: &Cx,
        schema: &Schema,
        deltas: &[(String, i64)],
        extra: &[(String, Value)],
        filter: &Where,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;
}
