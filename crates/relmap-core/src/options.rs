//! Find options, include requests and named scopes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::association::{Association, AssociationKind};
use crate::error::{EagerLoadingErrorKind, Error, Result};
use crate::predicate::Where;

/// Ordering term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Which attributes a query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSelection {
    /// Exactly these attributes
    Fields(Vec<String>),
    /// All persisted attributes, minus `exclude`, plus `include`
    Adjust {
        include: Vec<String>,
        exclude: Vec<String>,
    },
}

impl AttributeSelection {
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeSelection::Fields(names.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeSelection::Adjust {
            include: Vec::new(),
            exclude: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Union two selections of the same shape. Mixed shapes take `other`.
    pub fn merged(&self, other: &AttributeSelection) -> AttributeSelection {
        fn union(a: &[String], b: &[String]) -> Vec<String> {
            let mut out = a.to_vec();
            for item in b {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            out
        }
        match (self, other) {
            (AttributeSelection::Fields(a), AttributeSelection::Fields(b)) => {
                AttributeSelection::Fields(union(a, b))
            }
            (
                AttributeSelection::Adjust {
                    include: ia,
                    exclude: ea,
                },
                AttributeSelection::Adjust {
                    include: ib,
                    exclude: eb,
                },
            ) => AttributeSelection::Adjust {
                include: union(ia, ib),
                exclude: union(ea, eb),
            },
            (_, other) => other.clone(),
        }
    }
}

/// Kind token of an `all` include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeAllKind {
    /// Every association
    All,
    /// Single-valued associations
    One,
    /// Multi-valued associations
    Many,
    /// Associations keyed on the target (has-one, has-many)
    Has,
    /// Exactly one association kind
    Kind(AssociationKind),
}

impl IncludeAllKind {
    /// Parse a kind token. Unknown tokens are an eager-loading error.
    pub fn parse(token: &str) -> Result<Self> {
        Ok(match token {
            "All" => IncludeAllKind::All,
            "One" => IncludeAllKind::One,
            "Many" => IncludeAllKind::Many,
            "Has" => IncludeAllKind::Has,
            "BelongsTo" => IncludeAllKind::Kind(AssociationKind::ManyToOne),
            "HasOne" => IncludeAllKind::Kind(AssociationKind::OneToOne),
            "HasMany" => IncludeAllKind::Kind(AssociationKind::OneToMany),
            "BelongsToMany" => IncludeAllKind::Kind(AssociationKind::ManyToMany),
            other => {
                return Err(Error::eager_loading(
                    EagerLoadingErrorKind::InvalidIncludeAll,
                    format!(
                        "include all '{other}' is not valid - must be BelongsTo, HasOne, HasMany, One, Has, Many or All"
                    ),
                ));
            }
        })
    }

    pub fn admits(self, kind: AssociationKind) -> bool {
        match self {
            IncludeAllKind::All => true,
            IncludeAllKind::One => kind.is_single_valued(),
            IncludeAllKind::Many => kind.is_multi_valued(),
            IncludeAllKind::Has => kind.key_on_target(),
            IncludeAllKind::Kind(k) => k == kind,
        }
    }
}

/// Include every association admitted by `kinds`, optionally recursively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeAll {
    pub kinds: Vec<IncludeAllKind>,
    pub nested: bool,
}

impl IncludeAll {
    /// Parse kind tokens such as `["Many"]` or `["BelongsTo", "HasOne"]`.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let kinds = tokens
            .iter()
            .map(|t| IncludeAllKind::parse(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kinds,
            nested: false,
        })
    }

    pub fn everything() -> Self {
        Self {
            kinds: vec![IncludeAllKind::All],
            nested: false,
        }
    }

    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    pub fn admits(&self, kind: AssociationKind) -> bool {
        self.kinds.iter().any(|k| k.admits(kind))
    }
}

/// Options applying to the junction of a many-to-many include.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThroughOptions {
    pub filter: Option<Where>,
    pub attributes: Option<Vec<String>>,
    pub paranoid: Option<bool>,
}

/// A fully spelled-out include.
#[derive(Debug, Clone, Default)]
pub struct IncludeOptions {
    pub model: Option<String>,
    pub association: Option<Arc<Association>>,
    pub alias: Option<String>,
    pub filter: Option<Where>,
    pub attributes: Option<AttributeSelection>,
    /// Inner-join semantics; defaults to whether a filter is present
    pub required: Option<bool>,
    /// Load through a follow-up query instead of a join
    pub separate: Option<bool>,
    pub limit: Option<u64>,
    pub order: Vec<OrderBy>,
    /// `None` means deletion filtering applies
    pub paranoid: Option<bool>,
    pub duplicating: Option<bool>,
    pub through: Option<ThroughOptions>,
    pub include: Vec<IncludeRequest>,
}

impl IncludeOptions {
    pub fn model(name: impl Into<String>) -> Self {
        Self {
            model: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn alias(alias: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            ..Self::default()
        }
    }

    pub fn association(association: Arc<Association>) -> Self {
        Self {
            association: Some(association),
            ..Self::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn separate(mut self, separate: bool) -> Self {
        self.separate = Some(separate);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = Some(paranoid);
        self
    }

    pub fn duplicating(mut self, duplicating: bool) -> Self {
        self.duplicating = Some(duplicating);
        self
    }

    pub fn through(mut self, through: ThroughOptions) -> Self {
        self.through = Some(through);
        self
    }

    pub fn include(mut self, include: impl Into<IncludeRequest>) -> Self {
        self.include.push(include.into());
        self
    }
}

/// The shapes an include may be requested in.
#[derive(Debug, Clone)]
pub enum IncludeRequest {
    /// A target entity by name
    Model(String),
    /// An association alias of the parent; dotted paths nest (`"team.city"`)
    Alias(String),
    /// An association handle
    Association(Arc<Association>),
    /// A fully spelled-out include
    Node(Box<IncludeOptions>),
    /// Every association admitted by the kind tokens
    All(IncludeAll),
}

impl IncludeRequest {
    pub fn model(name: impl Into<String>) -> Self {
        IncludeRequest::Model(name.into())
    }

    pub fn alias(alias: impl Into<String>) -> Self {
        IncludeRequest::Alias(alias.into())
    }

    /// Identity used for scope include precedence: (target, alias).
    /// `All` requests have none and are never merged away.
    pub fn identity(&self) -> Option<(Option<&str>, Option<&str>)> {
        match self {
            IncludeRequest::Model(m) => Some((Some(m), None)),
            IncludeRequest::Alias(a) => Some((None, Some(a))),
            IncludeRequest::Association(a) => Some((Some(&a.target), Some(&a.alias))),
            IncludeRequest::Node(opts) => Some((
                opts.model
                    .as_deref()
                    .or_else(|| opts.association.as_ref().map(|a| a.target.as_str())),
                opts.alias
                    .as_deref()
                    .or_else(|| opts.association.as_ref().map(|a| a.alias.as_str())),
            )),
            IncludeRequest::All(_) => None,
        }
    }
}

impl From<&str> for IncludeRequest {
    fn from(alias: &str) -> Self {
        IncludeRequest::Alias(alias.to_string())
    }
}

impl From<IncludeOptions> for IncludeRequest {
    fn from(options: IncludeOptions) -> Self {
        IncludeRequest::Node(Box::new(options))
    }
}

impl From<Arc<Association>> for IncludeRequest {
    fn from(association: Arc<Association>) -> Self {
        IncludeRequest::Association(association)
    }
}

impl From<IncludeAll> for IncludeRequest {
    fn from(all: IncludeAll) -> Self {
        IncludeRequest::All(all)
    }
}

/// Options of a find call.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub filter: Option<Where>,
    pub attributes: Option<AttributeSelection>,
    pub include: Vec<IncludeRequest>,
    pub order: Vec<OrderBy>,
    pub group: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Apply deletion filtering (default true)
    pub paranoid: bool,
    /// Return one record per storage row without grouping includes
    pub raw: bool,
    /// Fail with `EmptyResult` when nothing matches
    pub reject_on_empty: bool,
    /// Count distinct root rows
    pub distinct: bool,
    /// Run find hooks (default true)
    pub hooks: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            filter: None,
            attributes: None,
            include: Vec::new(),
            order: Vec::new(),
            group: Vec::new(),
            limit: None,
            offset: None,
            paranoid: true,
            raw: false,
            reject_on_empty: false,
            distinct: false,
            hooks: true,
        }
    }
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conjoin a filter with whatever is already set.
    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = Some(Where::conjoin(self.filter.take(), filter));
        self
    }

    pub fn attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn include(mut self, include: impl Into<IncludeRequest>) -> Self {
        self.include.push(include.into());
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn group(mut self, field: impl Into<String>) -> Self {
        self.group.push(field.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn reject_on_empty(mut self, reject: bool) -> Self {
        self.reject_on_empty = reject;
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn hooks(mut self, hooks: bool) -> Self {
        self.hooks = hooks;
        self
    }
}

/// A named, reusable bundle of find options.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub filter: Option<Where>,
    pub attributes: Option<AttributeSelection>,
    pub include: Vec<IncludeRequest>,
    pub order: Vec<OrderBy>,
    pub group: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = Some(Where::conjoin(self.filter.take(), filter));
        self
    }

    pub fn attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn include(mut self, include: impl Into<IncludeRequest>) -> Self {
        self.include.push(include.into());
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn group(mut self, field: impl Into<String>) -> Self {
        self.group.push(field.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_none()
            && self.attributes.is_none()
            && self.include.is_empty()
            && self.order.is_empty()
            && self.group.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
    }
}
