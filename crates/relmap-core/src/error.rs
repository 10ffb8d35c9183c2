//! Error types for relmap operations.

use std::fmt;

use crate::predicate::Where;
use crate::value::Value;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed find/save request (unknown scope, unresolvable include shape)
    Request(RequestError),
    /// Eager-load planning failed (not associated, ambiguous alias, bad separate)
    EagerLoading(EagerLoadingError),
    /// Field-level validation failed for a single record
    Validation(ValidationError),
    /// Validation failed for one or more records of a bulk operation
    BulkValidation(BulkValidationError),
    /// A versioned update or delete matched zero rows
    OptimisticLock(OptimisticLockError),
    /// The storage rejected a write because of a unique constraint
    UniqueConstraint(UniqueConstraintError),
    /// A finder was asked to reject empty results and found nothing
    EmptyResult(EmptyResultError),
    /// Restore was requested on an entity without soft deletion
    NotParanoid(NotParanoidError),
    /// Schema registration or lookup errors
    Schema(SchemaError),
    /// A lifecycle hook aborted the operation
    Hook(HookError),
    /// Storage backend failure
    Storage(StorageError),
    /// Type conversion errors
    Type(TypeError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct RequestError {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct EagerLoadingError {
    pub kind: EagerLoadingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerLoadingErrorKind {
    /// The requested target has no association with the parent
    NotAssociated,
    /// The target is associated more than once and no alias picked one
    AmbiguousAlias,
    /// The alias given does not match any association to the target
    AliasMismatch,
    /// `separate` was requested on an association that cannot be split
    InvalidSeparate,
    /// An `all` include used an unknown association-kind token
    InvalidIncludeAll,
}

/// Validation error for field-level and model-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors in the order they were found
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Non-nullable field is null
    NotNull,
    /// Value is not one of the allowed values
    OneOf,
    /// Custom validation failed
    Custom,
    /// Model-level validation failed
    Model,
}

/// Validation failures collected across the records of a bulk operation.
#[derive(Debug, Clone)]
pub struct BulkValidationError {
    pub errors: Vec<RecordValidationError>,
}

#[derive(Debug, Clone)]
pub struct RecordValidationError {
    /// Position of the record in the batch
    pub index: usize,
    pub error: ValidationError,
}

#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity: String,
    pub filter: Where,
    pub values: Vec<(String, Value)>,
}

#[derive(Debug, Clone)]
pub struct UniqueConstraintError {
    pub entity: String,
    /// Offending columns and the values that collided
    pub fields: Vec<(String, Value)>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct EmptyResultError {
    pub entity: String,
}

#[derive(Debug, Clone)]
pub struct NotParanoidError {
    pub entity: String,
    pub operation: &'static str,
}

#[derive(Debug, Clone)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Two fields share a name
    DuplicateField,
    /// A field named like the implicit primary key is not flagged as one
    PrimaryKeyConflict,
    /// Field not found
    UnknownField,
    /// Entity not registered
    UnknownEntity,
    /// Entity registered twice
    DuplicateEntity,
    /// Association alias used twice on one source
    DuplicateAlias,
    /// Invalid schema definition
    Invalid,
}

#[derive(Debug, Clone)]
pub struct HookError {
    pub hook: String,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other backend error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl RequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl EagerLoadingError {
    pub fn new(kind: EagerLoadingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a min value error.
    pub fn add_min(
        &mut self,
        field: impl Into<String>,
        min: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) {
        self.add(
            field,
            ValidationErrorKind::Min,
            format!("must be at least {min}, got {actual}"),
        );
    }

    /// Add a max value error.
    pub fn add_max(
        &mut self,
        field: impl Into<String>,
        max: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) {
        self.add(
            field,
            ValidationErrorKind::Max,
            format!("must be at most {max}, got {actual}"),
        );
    }

    /// Add a min length error.
    pub fn add_min_length(&mut self, field: impl Into<String>, min: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MinLength,
            format!("must be at least {min} characters, got {actual}"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(&mut self, field: impl Into<String>, max: usize, actual: usize) {
        self.add(
            field,
            ValidationErrorKind::MaxLength,
            format!("must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, field: impl Into<String>, pattern: &str) {
        self.add(
            field,
            ValidationErrorKind::Pattern,
            format!("must match pattern '{pattern}'"),
        );
    }

    /// Add a not-null violation for `entity.field`.
    pub fn add_not_null(&mut self, entity: &str, field: impl Into<String>) {
        let field = field.into();
        let message = format!("{entity}.{field} cannot be null");
        self.add(field, ValidationErrorKind::NotNull, message);
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, ValidationErrorKind::Custom, message);
    }

    /// Add a model-level validation error, recorded with field "__model__".
    pub fn add_model_error(&mut self, message: impl Into<String>) {
        self.add("__model__", ValidationErrorKind::Model, message);
    }

    /// Field names that failed, in order, without duplicates.
    pub fn fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for err in &self.errors {
            if !out.contains(&err.field.as_str()) {
                out.push(&err.field);
            }
        }
        out
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Shorthand for a request error.
    pub fn request(message: impl Into<String>) -> Self {
        Error::Request(RequestError::new(message))
    }

    /// Shorthand for a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError::new(kind, message))
    }

    /// Shorthand for an eager-loading error.
    pub fn eager_loading(kind: EagerLoadingErrorKind, message: impl Into<String>) -> Self {
        Error::EagerLoading(EagerLoadingError::new(kind, message))
    }

    /// Is this a unique constraint violation, either typed or by SQLSTATE?
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::UniqueConstraint(_) => true,
            Error::Storage(e) => e.is_unique_violation(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Storage(e) => e.sqlstate.as_deref(),
            Error::UniqueConstraint(_) => Some("23505"),
            _ => None,
        }
    }
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Request(e) => write!(f, "Request error: {}", e.message),
            Error::EagerLoading(e) => write!(f, "Eager loading error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::BulkValidation(e) => write!(f, "Bulk validation error: {}", e),
            Error::OptimisticLock(e) => write!(f, "{}", e),
            Error::UniqueConstraint(e) => write!(f, "Unique constraint error: {}", e.message),
            Error::EmptyResult(e) => write!(f, "No {} records found", e.entity),
            Error::NotParanoid(e) => write!(
                f,
                "Model {} is not paranoid; cannot {}",
                e.entity, e.operation
            ),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Hook(e) => write!(f, "Hook '{}' failed: {}", e.hook, e.message),
            Error::Storage(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Storage error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Storage error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Attempting to update a stale {} instance; no row matched {:?}",
            self.entity, self.filter
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl fmt::Display for BulkValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} record(s) failed validation", self.errors.len())?;
        for item in &self.errors {
            write!(f, "; #{}: {}", item.index, item.error)?;
        }
        Ok(())
    }
}

impl From<RequestError> for Error {
    fn from(err: RequestError) -> Self {
        Error::Request(err)
    }
}

impl From<EagerLoadingError> for Error {
    fn from(err: EagerLoadingError) -> Self {
        Error::EagerLoading(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<BulkValidationError> for Error {
    fn from(err: BulkValidationError) -> Self {
        Error::BulkValidation(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<UniqueConstraintError> for Error {
    fn from(err: UniqueConstraintError) -> Self {
        Error::UniqueConstraint(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
