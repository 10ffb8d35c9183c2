//! Record validation.
//!
//! The coordinator asks a [`Validator`] to check a record before any hook
//! or storage work happens. [`RuleValidator`] is the declarative
//! implementation: not-null checks derived from the schema plus per-field
//! and per-model rules registered by entity.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

use asupersync::{Cx, Outcome};
use regex::Regex;
use relmap_core::{AssociationKind, Error, Record, Related, ValidationError, ValidationErrorKind, Value};

/// Attributes to leave unchecked in one validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    pub skip: Vec<String>,
}

impl ValidateOptions {
    pub fn skip(fields: Vec<String>) -> Self {
        Self { skip: fields }
    }

    pub fn is_skipped(&self, field: &str) -> bool {
        self.skip.iter().any(|s| s == field)
    }
}

/// Checks records before they are written.
pub trait Validator: Send + Sync {
    /// Fail with `Error::Validation` listing every violated constraint.
    fn validate(
        &self,
        cx: &Cx,
        record: &Record,
        options: &ValidateOptions,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}

type CustomRule = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;
type ModelRule = Arc<dyn Fn(&Record) -> std::result::Result<(), String> + Send + Sync>;

/// A constraint on one attribute. Rules other than `NotNull` pass on NULL.
#[derive(Clone)]
pub enum FieldRule {
    NotNull,
    Length { min: Option<usize>, max: Option<usize> },
    Pattern(String),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<Value>),
    Custom(CustomRule),
}

impl FieldRule {
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        FieldRule::Custom(Arc::new(check))
    }

    fn check(&self, entity: &str, field: &str, value: &Value, errors: &mut ValidationError) {
        if value.is_null() {
            if matches!(self, FieldRule::NotNull) {
                errors.add_not_null(entity, field);
            }
            return;
        }
        match self {
            FieldRule::NotNull => {}
            FieldRule::Length { min, max } => {
                let Some(text) = value.as_str() else {
                    return;
                };
                let len = text.chars().count();
                if let Some(min) = min.filter(|m| len < *m) {
                    errors.add_min_length(field, min, len);
                }
                if let Some(max) = max.filter(|m| len > *m) {
                    errors.add_max_length(field, max, len);
                }
            }
            FieldRule::Pattern(pattern) => {
                let matched = value.as_str().is_some_and(|s| matches_pattern(s, pattern));
                if !matched {
                    errors.add_pattern(field, pattern);
                }
            }
            FieldRule::Range { min, max } => {
                let Some(number) = value.as_f64() else {
                    errors.add_custom(field, format!("expected a number, got {}", value.type_name()));
                    return;
                };
                if let Some(min) = min.filter(|m| number < *m) {
                    errors.add_min(field, min, number);
                }
                if let Some(max) = max.filter(|m| number > *m) {
                    errors.add_max(field, max, number);
                }
            }
            FieldRule::OneOf(allowed) => {
                if !allowed.iter().any(|a| a.sql_eq(value)) {
                    errors.add(field, ValidationErrorKind::OneOf, "is not one of the allowed values");
                }
            }
            FieldRule::Custom(check) => {
                if let Err(message) = check(value) {
                    errors.add_custom(field, message);
                }
            }
        }
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRule::NotNull => f.write_str("NotNull"),
            FieldRule::Length { min, max } => f
                .debug_struct("Length")
                .field("min", min)
                .field("max", max)
                .finish(),
            FieldRule::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            FieldRule::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            FieldRule::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            FieldRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Declarative validator keyed by entity name.
#[derive(Clone, Default)]
pub struct RuleValidator {
    fields: HashMap<String, Vec<(String, FieldRule)>>,
    models: HashMap<String, Vec<ModelRule>>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rule(mut self, entity: impl Into<String>, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields
            .entry(entity.into())
            .or_default()
            .push((field.into(), rule));
        self
    }

    /// A check over the whole record; failures are reported under
    /// the `__model__` field.
    #[must_use]
    pub fn model_rule<F>(mut self, entity: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Record) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.models.entry(entity.into()).or_default().push(Arc::new(check));
        self
    }

    /// Run every applicable check, collecting all failures.
    pub fn check(&self, record: &Record, options: &ValidateOptions) -> std::result::Result<(), ValidationError> {
        let schema = record.schema();
        let entity = schema.name();
        let mut errors = ValidationError::new();

        for attr in schema.attributes() {
            if attr.nullable || attr.auto_increment || attr.is_virtual() || options.is_skipped(&attr.name) {
                continue;
            }
            if is_managed(record, &attr.name) {
                continue;
            }
            let value = record.get_data_value(&attr.name).unwrap_or(&Value::Null);
            if value.is_null() && !has_attached_parent(record, &attr.name) {
                errors.add_not_null(entity, attr.name.clone());
            }
        }

        if let Some(rules) = self.fields.get(entity) {
            for (field, rule) in rules {
                if options.is_skipped(field) {
                    continue;
                }
                let value = record.get(field);
                rule.check(entity, field, &value, &mut errors);
            }
        }

        if let Some(rules) = self.models.get(entity) {
            for rule in rules {
                if let Err(message) = rule(record) {
                    errors.add_model_error(message);
                }
            }
        }

        if !errors.is_empty() {
            tracing::debug!(entity, fields = ?errors.fields(), "Validation failed");
        }
        errors.into_result()
    }
}

impl Validator for RuleValidator {
    fn validate(
        &self,
        cx: &Cx,
        record: &Record,
        options: &ValidateOptions,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => match self.check(record, options) {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(Error::Validation(e)),
            },
        };
        std::future::ready(outcome)
    }
}

impl fmt::Debug for RuleValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleValidator")
            .field("fields", &self.fields)
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Timestamps and the version counter are filled in by the coordinator.
fn is_managed(record: &Record, field: &str) -> bool {
    let schema = record.schema();
    [schema.created_at(), schema.updated_at(), schema.version_field()]
        .into_iter()
        .flatten()
        .any(|managed| managed == field)
}

/// A belongs-to key may stay NULL while the referenced record is attached
/// and not yet saved.
fn has_attached_parent(record: &Record, field: &str) -> bool {
    record.include().iter().any(|include| {
        include.association.kind == AssociationKind::ManyToOne
            && include.association.foreign_key == field
            && matches!(record.related(&include.alias), Some(Related::One(Some(_))))
    })
}

/// Cache of compiled patterns shared by every validator.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Whether `value` matches `pattern`. An invalid pattern never matches.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}
