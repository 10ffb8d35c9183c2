//! Association metadata.
//!
//! An association is a typed edge from a source entity to a target entity.
//! Associations are declared on a [`RegistryBuilder`](crate::registry::RegistryBuilder)
//! and frozen together with the schemas, so planners and coordinators can
//! share them through `Arc` without locking.

use serde::{Deserialize, Serialize};

use crate::predicate::Where;

/// The type of association between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    /// Belongs-to: the foreign key lives on the source (`Player.team_id`).
    ManyToOne,
    /// Has-one: the foreign key lives on the target (`User` has one `Profile`).
    OneToOne,
    /// Has-many: the foreign key lives on the target (`Team` has many `Player`s).
    OneToMany,
    /// Belongs-to-many: both keys live on a junction entity.
    ManyToMany,
}

impl AssociationKind {
    /// Whether loading this association yields at most one record.
    pub const fn is_single_valued(self) -> bool {
        matches!(self, AssociationKind::ManyToOne | AssociationKind::OneToOne)
    }

    pub const fn is_multi_valued(self) -> bool {
        !self.is_single_valued()
    }

    /// Whether joining this association can repeat parent rows.
    pub const fn is_duplicating(self) -> bool {
        self.is_multi_valued()
    }

    /// Conventional name of the kind, as used in `all` include tokens.
    pub const fn as_str(self) -> &'static str {
        match self {
            AssociationKind::ManyToOne => "BelongsTo",
            AssociationKind::OneToOne => "HasOne",
            AssociationKind::OneToMany => "HasMany",
            AssociationKind::ManyToMany => "BelongsToMany",
        }
    }

    /// Whether the foreign key is stored on the target entity.
    pub const fn key_on_target(self) -> bool {
        matches!(self, AssociationKind::OneToOne | AssociationKind::OneToMany)
    }
}

/// Junction entity of a many-to-many association.
#[derive(Debug, Clone, PartialEq)]
pub struct Through {
    /// Registered name of the junction entity
    pub model: String,
    /// Junction attribute referencing the source key
    pub foreign_key: String,
    /// Junction attribute referencing the target key
    pub other_key: String,
    /// Filter every junction row must satisfy
    pub scope: Option<Where>,
}

impl Through {
    pub fn new(
        model: impl Into<String>,
        foreign_key: impl Into<String>,
        other_key: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            foreign_key: foreign_key.into(),
            other_key: other_key.into(),
            scope: None,
        }
    }

    pub fn scope(mut self, scope: Where) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// Metadata about one association.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// Name under which related records are attached to a source record
    pub alias: String,
    /// Whether the alias was chosen explicitly rather than defaulted
    pub aliased: bool,
    pub source: String,
    pub target: String,
    pub kind: AssociationKind,
    /// For belongs-to the source attribute; for has-one/has-many the target
    /// attribute. Unused by many-to-many, which keys through the junction.
    pub foreign_key: String,
    /// Key on the source the association joins on (defaults to its primary key)
    pub source_key: Option<String>,
    /// Key on the target the association joins on (defaults to its primary key)
    pub target_key: Option<String>,
    pub through: Option<Through>,
    /// Filter applied to the target whenever the association is loaded
    pub scope: Option<Where>,
}

impl Association {
    fn new(
        kind: AssociationKind,
        source: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let target = target.into();
        Self {
            alias: target.clone(),
            aliased: false,
            source: source.into(),
            target,
            kind,
            foreign_key: foreign_key.into(),
            source_key: None,
            target_key: None,
            through: None,
            scope: None,
        }
    }

    /// `source.foreign_key` references `target`.
    pub fn belongs_to(
        source: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::ManyToOne, source, target, foreign_key)
    }

    /// `target.foreign_key` references `source`, at most one target per source.
    pub fn has_one(
        source: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::OneToOne, source, target, foreign_key)
    }

    /// `target.foreign_key` references `source`.
    pub fn has_many(
        source: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::new(AssociationKind::OneToMany, source, target, foreign_key)
    }

    /// Source and target linked by rows of a junction entity.
    pub fn belongs_to_many(
        source: impl Into<String>,
        target: impl Into<String>,
        through: Through,
    ) -> Self {
        let mut assoc = Self::new(
            AssociationKind::ManyToMany,
            source,
            target,
            through.foreign_key.clone(),
        );
        assoc.through = Some(through);
        assoc
    }

    /// Attach under an explicit alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self.aliased = true;
        self
    }

    pub fn source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }

    pub fn scope(mut self, scope: Where) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Resolved source key. The registry fills this in at build time.
    pub fn source_key_name(&self) -> &str {
        self.source_key.as_deref().unwrap_or("id")
    }

    /// Resolved target key. The registry fills this in at build time.
    pub fn target_key_name(&self) -> &str {
        self.target_key.as_deref().unwrap_or("id")
    }

    pub fn is_single_valued(&self) -> bool {
        self.kind.is_single_valued()
    }

    pub fn is_multi_valued(&self) -> bool {
        self.kind.is_multi_valued()
    }

    /// Alias matching as used by include resolution: an explicit alias must
    /// match exactly; without one only the association's own alias counts.
    pub fn answers_to(&self, alias: Option<&str>) -> bool {
        match alias {
            Some(alias) => self.alias == alias,
            None => true,
        }
    }
}
