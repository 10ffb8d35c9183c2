//! Filter predicates over attribute values.
//!
//! A [`Where`] tree is what finders, scopes and association scopes carry
//! around; conjunction is the only way two predicates are ever combined
//! implicitly.

use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Op {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Gt => ordering == Ordering::Greater,
            Op::Gte => ordering != Ordering::Less,
            Op::Lt => ordering == Ordering::Less,
            Op::Lte => ordering != Ordering::Greater,
        }
    }
}

/// A filter predicate. Field names are attribute names, never column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Where {
    /// All must hold; an empty list always holds
    And(Vec<Where>),
    /// Any must hold; an empty list never holds
    Or(Vec<Where>),
    Not(Box<Where>),
    Cmp { field: String, op: Op, value: Value },
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    IsNull { field: String, negated: bool },
    /// SQL LIKE with `%` and `_` wildcards
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
}

impl Where {
    pub fn cmp(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Where::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, Op::Lte, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Where::IsNull {
            field: field.into(),
            negated: false,
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Where::IsNull {
            field: field.into(),
            negated: true,
        }
    }

    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Where::In {
            field: field.into(),
            values,
            negated: false,
        }
    }

    pub fn not_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Where::In {
            field: field.into(),
            values,
            negated: true,
        }
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Where::Like {
            field: field.into(),
            pattern: pattern.into(),
            negated: false,
        }
    }

    /// A predicate that always holds.
    pub fn all() -> Self {
        Where::And(Vec::new())
    }

    /// Equality on every (field, value) pair.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Where::And(pairs.into_iter().map(|(k, v)| Where::eq(k, v)).collect())
    }

    /// Conjunction. Nested `And` lists are flattened so repeated scoping
    /// does not build deep trees.
    #[must_use]
    pub fn and(self, other: Where) -> Where {
        let mut parts = match self {
            Where::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Where::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Where::And(parts)
    }

    #[must_use]
    pub fn or(self, other: Where) -> Where {
        let mut parts = match self {
            Where::Or(parts) => parts,
            single => vec![single],
        };
        match other {
            Where::Or(more) => parts.extend(more),
            single => parts.push(single),
        }
        Where::Or(parts)
    }

    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn not(self) -> Where {
        Where::Not(Box::new(self))
    }

    /// Conjoin an optional existing predicate with another one.
    pub fn conjoin(existing: Option<Where>, other: Where) -> Where {
        match existing {
            Some(existing) => existing.and(other),
            None => other,
        }
    }

    /// Whether the predicate trivially holds (an empty conjunction).
    pub fn is_trivial(&self) -> bool {
        matches!(self, Where::And(parts) if parts.iter().all(Where::is_trivial))
    }

    /// Attribute names the predicate reads, in first-seen order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Where::And(parts) | Where::Or(parts) => {
                for part in parts {
                    part.collect_fields(out);
                }
            }
            Where::Not(inner) => inner.collect_fields(out),
            Where::Cmp { field, .. }
            | Where::In { field, .. }
            | Where::IsNull { field, .. }
            | Where::Like { field, .. } => {
                if !out.contains(&field.as_str()) {
                    out.push(field);
                }
            }
        }
    }

    /// The value a top-level equality pins `field` to, if any.
    pub fn equality_on(&self, field: &str) -> Option<&Value> {
        match self {
            Where::Cmp {
                field: f,
                op: Op::Eq,
                value,
            } if f == field => Some(value),
            Where::And(parts) => parts.iter().find_map(|p| p.equality_on(field)),
            _ => None,
        }
    }

    /// Evaluate against a value lookup. Missing fields read as NULL, and any
    /// comparison involving NULL is false.
    pub fn matches<'v, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'v Value>,
    {
        let read = |field: &str| lookup(field).unwrap_or(&Value::Null);
        match self {
            Where::And(parts) => parts.iter().all(|p| p.matches(lookup)),
            Where::Or(parts) => parts.iter().any(|p| p.matches(lookup)),
            Where::Not(inner) => !inner.matches(lookup),
            Where::Cmp { field, op, value } => read(field)
                .sql_cmp(value)
                .is_some_and(|ordering| op.holds(ordering)),
            Where::In {
                field,
                values,
                negated,
            } => {
                let current = read(field);
                if current.is_null() {
                    return false;
                }
                values.iter().any(|v| current.sql_eq(v)) != *negated
            }
            Where::IsNull { field, negated } => read(field).is_null() != *negated,
            Where::Like {
                field,
                pattern,
                negated,
            } => match read(field).as_str() {
                Some(text) => like_matches(pattern, text) != *negated,
                None => false,
            },
        }
    }
}

/// Translate a LIKE pattern into an anchored regex and test it.
fn like_matches(pattern: &str, text: &str) -> bool {
    let mut source = String::from("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    match Regex::new(&source) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid LIKE pattern");
            false
        }
    }
}
