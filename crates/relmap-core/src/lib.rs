//! Core types for relmap.
//!
//! This crate holds the declarative layer of the mapper:
//!
//! - [`Schema`] and [`Registry`] for entity and association metadata
//! - [`Record`] with change tracking against the last-persisted snapshot
//! - [`Where`] predicates and the find/include option types
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod association;
pub mod attribute;
pub mod error;
pub mod options;
pub mod predicate;
pub mod record;
pub mod registry;
pub mod row;
pub mod schema;
pub mod tracker;
pub mod types;
pub mod value;

pub use association::{Association, AssociationKind, Through};
pub use attribute::{AccessorTable, AttributeDef, DefaultValue, GetterFn, SetterFn, Unique};
pub use error::{
    BulkValidationError, EagerLoadingError, EagerLoadingErrorKind, EmptyResultError, Error,
    FieldValidationError, HookError, NotParanoidError, OptimisticLockError, RecordValidationError,
    RequestError, Result, SchemaError, SchemaErrorKind, StorageError, StorageErrorKind, TypeError,
    UniqueConstraintError, ValidationError, ValidationErrorKind,
};
pub use options::{
    AttributeSelection, FindOptions, IncludeAll, IncludeAllKind, IncludeOptions, IncludeRequest,
    OrderBy, Scope, ThroughOptions,
};
pub use predicate::{Op, Where};
pub use record::{
    AttachedInclude, BuildOptions, Checkpoint, Record, Related, SetOptions, now_micros,
};
pub use registry::{Registry, RegistryBuilder};
pub use row::{ColumnInfo, FromValue, Row};
pub use schema::{Schema, SchemaOptions, UniqueKey};
pub use tracker::ChangeTracker;
pub use types::DataType;
pub use value::Value;
