//! relmap - a relational object-mapper core.
//!
//! relmap keeps entity metadata, eager-load planning and the record
//! persistence lifecycle in one place:
//!
//! - Entity schemas and associations registered in a [`Registry`]
//! - [`Record`]s with change tracking against their last-persisted state
//! - Include planning that decides join, subquery and separate-fetch layout
//! - A [`PersistenceCoordinator`] driving validation, hooks, cascades,
//!   optimistic locking and soft deletion over a [`Storage`] backend
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relmap::prelude::*;
//!
//! async fn main_example(cx: &Cx) -> Outcome<(), Error> {
//!     let registry = Arc::new(
//!         Registry::builder()
//!             .define("Team", vec![AttributeDef::new("name", DataType::Text)], SchemaOptions::new())?
//!             .define(
//!                 "Player",
//!                 vec![
//!                     AttributeDef::new("name", DataType::Text),
//!                     AttributeDef::new("team_id", DataType::Integer),
//!                 ],
//!                 SchemaOptions::new().versioned(),
//!             )?
//!             .associate(Association::has_many("Team", "Player", "team_id").alias("players"))
//!             .build()?,
//!     );
//!     let coordinator = PersistenceCoordinator::new(Arc::clone(&registry), MemoryStorage::new(registry));
//!
//!     // Create
//!     let team = coordinator.create(cx, "Team", [("name", "reds")], &SaveOptions::new()).await;
//!
//!     // Query with an eager load
//!     let view = coordinator.view("Team")?;
//!     let teams = coordinator
//!         .find_all(cx, &view, FindOptions::new().include("players").limit(10))
//!         .await;
//!     Outcome::Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Pluggable storage**: Any backend implementing [`Storage`]; [`MemoryStorage`] ships in-process
//! - **Lifecycle hooks**: Synchronous callbacks around validation, save, destroy and find
//! - **Soft deletion**: Paranoid entities are filtered by default and restorable

// Re-export all public types from sub-crates
pub use relmap_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Metadata
    AccessorTable,
    Association,
    AssociationKind,
    AttributeDef,
    DataType,
    DefaultValue,
    Registry,
    RegistryBuilder,
    Schema,
    SchemaOptions,
    Through,
    Unique,
    UniqueKey,
    // Records
    AttachedInclude,
    BuildOptions,
    ChangeTracker,
    Checkpoint,
    Record,
    Related,
    Row,
    SetOptions,
    Value,
    now_micros,
    // Options and predicates
    AttributeSelection,
    FindOptions,
    IncludeAll,
    IncludeAllKind,
    IncludeOptions,
    IncludeRequest,
    Op,
    OrderBy,
    Scope,
    ThroughOptions,
    Where,
    // Errors
    BulkValidationError,
    EagerLoadingError,
    EagerLoadingErrorKind,
    EmptyResultError,
    Error,
    FieldValidationError,
    HookError,
    NotParanoidError,
    OptimisticLockError,
    RecordValidationError,
    RequestError,
    Result,
    SchemaError,
    SchemaErrorKind,
    StorageError,
    StorageErrorKind,
    UniqueConstraintError,
    ValidationError,
    ValidationErrorKind,
};

pub use relmap_query::{
    GroupedLimit, IncludeNode, IncludePlanner, NodeId, QueryPlan, ScopedView, apply_scope,
    conform, merge_scopes, paranoid_clause,
};

pub use relmap_persist::{
    Aggregate, BoxOutcome, BulkInsertOptions, BulkOptions, DestroyOptions, FieldRule, HookArgs,
    HookFn, HookPipeline, HookPoint, MemoryStorage, PersistConfig, PersistenceCoordinator,
    RuleValidator, SaveOptions, Storage, ValidateOptions, Validator, WriteResult, hydrate,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use relmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Metadata
        Association,
        AttributeDef,
        DataType,
        Registry,
        SchemaOptions,
        Through,
        // Records
        Record,
        Related,
        SetOptions,
        Value,
        // Finding
        FindOptions,
        IncludeAll,
        IncludeOptions,
        IncludeRequest,
        OrderBy,
        Scope,
        ScopedView,
        Where,
        // Persistence
        BulkOptions,
        DestroyOptions,
        Error,
        FieldRule,
        HookArgs,
        HookPoint,
        MemoryStorage,
        PersistConfig,
        PersistenceCoordinator,
        Result,
        RuleValidator,
        SaveOptions,
        Storage,
    };
}
