//! Registry of schemas and associations.
//!
//! Schemas are declared and associated on a mutable [`RegistryBuilder`];
//! [`RegistryBuilder::build`] validates the association graph, resolves
//! default keys and freezes everything into an immutable [`Registry`] that
//! is shared by reference from then on.

use std::collections::HashMap;
use std::sync::Arc;

use crate::association::{Association, AssociationKind};
use crate::attribute::AttributeDef;
use crate::error::{Error, Result, SchemaErrorKind};
use crate::schema::{Schema, SchemaOptions};

/// Mutable registration phase.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    schemas: Vec<Schema>,
    associations: Vec<Association>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entity from its attributes.
    pub fn define(
        self,
        name: impl Into<String>,
        attributes: Vec<AttributeDef>,
        options: SchemaOptions,
    ) -> Result<Self> {
        let schema = Schema::register(name, attributes, options)?;
        self.register(schema)
    }

    /// Register an already-built schema.
    pub fn register(mut self, schema: Schema) -> Result<Self> {
        if self.schemas.iter().any(|s| s.name() == schema.name()) {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateEntity,
                format!("entity '{}' is already registered", schema.name()),
            ));
        }
        self.schemas.push(schema);
        Ok(self)
    }

    /// Declare an association. The graph is checked at build time.
    pub fn associate(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    /// Mutable access for `add_field`/`remove_field` before freezing.
    pub fn schema_mut(&mut self, name: &str) -> Option<&mut Schema> {
        self.schemas.iter_mut().find(|s| s.name() == name)
    }

    /// Validate associations and freeze.
    pub fn build(self) -> Result<Registry> {
        let RegistryBuilder {
            mut schemas,
            associations,
        } = self;

        let position = |schemas: &[Schema], name: &str| -> Result<usize> {
            schemas
                .iter()
                .position(|s| s.name() == name)
                .ok_or_else(|| {
                    Error::schema(
                        SchemaErrorKind::UnknownEntity,
                        format!("entity '{name}' is not registered"),
                    )
                })
        };

        for mut assoc in associations {
            let source = position(&schemas, &assoc.source)?;
            let target = position(&schemas, &assoc.target)?;

            if assoc.source_key.is_none() {
                assoc.source_key = Some(schemas[source].primary_key().to_string());
            }
            if assoc.target_key.is_none() {
                assoc.target_key = Some(schemas[target].primary_key().to_string());
            }

            let (key_holder, key) = match assoc.kind {
                AssociationKind::ManyToOne => (source, assoc.foreign_key.as_str()),
                AssociationKind::OneToOne | AssociationKind::OneToMany => {
                    (target, assoc.foreign_key.as_str())
                }
                AssociationKind::ManyToMany => {
                    let Some(through) = assoc.through.as_ref() else {
                        return Err(Error::schema(
                            SchemaErrorKind::Invalid,
                            format!(
                                "{}.{}: many-to-many association needs a junction entity",
                                assoc.source, assoc.alias
                            ),
                        ));
                    };
                    let junction = position(&schemas, &through.model)?;
                    if !schemas[junction].has_attribute(&through.other_key) {
                        return Err(unknown_key(&schemas[junction], &through.other_key));
                    }
                    (junction, through.foreign_key.as_str())
                }
            };
            if !schemas[key_holder].has_attribute(key) {
                return Err(unknown_key(&schemas[key_holder], key));
            }

            if schemas[source].association(&assoc.alias).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateAlias,
                    format!(
                        "{} already has an association named '{}'",
                        assoc.source, assoc.alias
                    ),
                ));
            }

            tracing::debug!(
                source = %assoc.source,
                target = %assoc.target,
                alias = %assoc.alias,
                kind = assoc.kind.as_str(),
                "registered association"
            );
            schemas[source].push_association(Arc::new(assoc));
        }

        let schemas = schemas
            .into_iter()
            .map(|s| (s.name().to_string(), Arc::new(s)))
            .collect();
        Ok(Registry { schemas })
    }
}

fn unknown_key(schema: &Schema, key: &str) -> Error {
    Error::schema(
        SchemaErrorKind::UnknownField,
        format!("{} has no attribute '{key}' to use as a key", schema.name()),
    )
}

/// Immutable set of schemas with their associations.
#[derive(Debug, Default)]
pub struct Registry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(name)
    }

    /// Look up a schema, failing for unknown entities.
    pub fn schema(&self, name: &str) -> Result<&Arc<Schema>> {
        self.schemas.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity '{name}' is not registered"),
            )
        })
    }

    /// Associations declared with `name` as source. Unknown names have none.
    pub fn associations_of(&self, name: &str) -> &[Arc<Association>] {
        match self.schemas.get(name) {
            Some(schema) => schema.associations(),
            None => &[],
        }
    }

    /// Associations from `source` to `target`, in declaration order.
    pub fn associations_between(&self, source: &str, target: &str) -> Vec<&Arc<Association>> {
        self.associations_of(source)
            .iter()
            .filter(|a| a.target == target)
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Through;
    use crate::types::DataType;

    fn builder() -> RegistryBuilder {
        Registry::builder()
            .define(
                "Team",
                vec![AttributeDef::new("name", DataType::Text)],
                SchemaOptions::default(),
            )
            .unwrap()
            .define(
                "Player",
                vec![
                    AttributeDef::new("name", DataType::Text),
                    AttributeDef::new("team_id", DataType::Integer),
                ],
                SchemaOptions::default(),
            )
            .unwrap()
    }

    #[test]
    fn build_resolves_keys() {
        let registry = builder()
            .associate(Association::has_many("Team", "Player", "team_id").alias("players"))
            .associate(Association::belongs_to("Player", "Team", "team_id").alias("team"))
            .build()
            .unwrap();
        let team = registry.schema("Team").unwrap();
        let players = team.association("players").unwrap();
        assert_eq!(players.source_key_name(), "id");
        assert_eq!(players.target_key_name(), "id");
        assert_eq!(team.associations_to("Player").len(), 1);
        assert_eq!(registry.associations_between("Player", "Team").len(), 1);
        assert!(registry.associations_of("Coach").is_empty());
        assert!(registry.schema("Coach").is_err());
    }

    #[test]
    fn rejects_unknown_entities_and_keys() {
        let err = builder()
            .associate(Association::has_many("Team", "Coach", "team_id"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::UnknownEntity));

        let err = builder()
            .associate(Association::has_many("Team", "Player", "club_id"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::UnknownField));
    }

    #[test]
    fn rejects_duplicate_alias() {
        let err = builder()
            .associate(Association::has_many("Team", "Player", "team_id").alias("p"))
            .associate(Association::has_one("Team", "Player", "team_id").alias("p"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::DuplicateAlias));
    }

    #[test]
    fn junction_must_be_registered() {
        let err = builder()
            .associate(Association::belongs_to_many(
                "Player",
                "Team",
                Through::new("PlayerTeam", "player_id", "team_id"),
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(ref e) if e.kind == SchemaErrorKind::UnknownEntity));
    }

    #[test]
    fn schema_mut_before_build() {
        let mut b = builder();
        b.schema_mut("Team")
            .unwrap()
            .add_field(AttributeDef::new("city", DataType::Text))
            .unwrap();
        let registry = b.build().unwrap();
        assert!(registry.schema("Team").unwrap().has_attribute("city"));
        assert_eq!(registry.len(), 2);
    }
}
