//! Query option resolution for relmap.
//!
//! A find request goes through three pure stages before anything touches
//! storage:
//!
//! 1. [`conform`] normalizes include shapes and attribute selections,
//! 2. [`apply_scope`] merges the active [`ScopedView`] scope in,
//! 3. [`IncludePlanner::validate`] resolves associations and decides the
//!    join/subquery layout, producing a [`QueryPlan`].

pub mod normalize;
pub mod plan;
pub mod planner;
pub mod scope;

pub use normalize::{
    NormalizedFind, NormalizedInclude, conform, expand_attributes, expand_include_all,
    normalize_includes,
};
pub use plan::{GroupedLimit, IncludeNode, NodeId, QueryPlan};
pub use planner::IncludePlanner;
pub use scope::{
    ScopedView, apply_scope, apply_scope_to_include, inject_paranoid, merge_scopes,
    paranoid_clause,
};
