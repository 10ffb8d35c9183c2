//! Record persistence lifecycle for relmap.
//!
//! The [`PersistenceCoordinator`] drives records through
//! validation, hooks and storage:
//!
//! - `save`, `update`, `destroy`, `restore`, `reload`, `increment` on one record
//! - `find_all` and friends, which plan, select and hydrate records
//! - `bulk_create`, `bulk_update`, `bulk_destroy`, `bulk_restore`
//!
//! Storage and validation are collaborators behind the [`Storage`] and
//! [`Validator`] traits; [`MemoryStorage`] and [`RuleValidator`] are the
//! in-process implementations.

use std::future::Future;
use std::pin::Pin;

use asupersync::Outcome;
use relmap_core::Error;

/// Propagate a non-`Ok` outcome from the enclosing async fn.
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            ::asupersync::Outcome::Ok(value) => value,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Propagate a synchronous error as `Outcome::Err`.
macro_rules! try_result {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod finder;
pub mod hooks;
pub mod hydrate;
pub mod memory;
pub mod storage;
pub mod validator;

pub use bulk::BulkOptions;
pub use config::PersistConfig;
pub use coordinator::{DestroyOptions, PersistenceCoordinator, SaveOptions};
pub use hooks::{HookArgs, HookFn, HookPipeline, HookPoint};
pub use hydrate::{attached_includes, hydrate};
pub use memory::MemoryStorage;
pub use storage::{Aggregate, BulkInsertOptions, Storage, WriteResult};
pub use validator::{FieldRule, RuleValidator, ValidateOptions, Validator};

/// Boxed outcome future, used where lifecycle steps recurse.
pub type BoxOutcome<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;
