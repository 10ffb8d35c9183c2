//! Scope resolution.
//!
//! A [`ScopedView`] is an immutable pairing of a schema with the scopes a
//! query should run under. Scopes merge into one [`Scope`], which is then
//! injected into normalized find options. Deletion filtering is injected
//! last, into the finished plan.

use std::sync::Arc;

use relmap_core::{Error, Registry, Result, Schema, Scope, Where};

use crate::normalize::{NormalizedFind, NormalizedInclude, expand_attributes, normalize_includes};
use crate::plan::QueryPlan;

/// A schema together with the scopes queries against it run under.
#[derive(Debug, Clone)]
pub struct ScopedView {
    schema: Arc<Schema>,
    overlay: Vec<Scope>,
    include_default: bool,
}

impl ScopedView {
    /// View under the entity's default scope.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            overlay: Vec::new(),
            include_default: true,
        }
    }

    /// View with no scope at all, the default scope included.
    #[must_use]
    pub fn unscoped(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            overlay: Vec::new(),
            include_default: false,
        }
    }

    /// View under exactly the named scopes, merged in order.
    ///
    /// `"default"` and `"defaultScope"` name the default scope.
    pub fn scope<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut overlay = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let scope = match name {
                "default" | "defaultScope" => self.schema.default_scope().cloned().unwrap_or_default(),
                _ => self
                    .schema
                    .named_scope(name)
                    .cloned()
                    .ok_or_else(|| Error::request(format!("Invalid scope {name} called.")))?,
            };
            overlay.push(scope);
        }
        Ok(Self {
            schema: Arc::clone(&self.schema),
            overlay,
            include_default: false,
        })
    }

    /// Add an ad-hoc scope on top of the current ones.
    #[must_use]
    pub fn with_scope(&self, scope: Scope) -> Self {
        let mut view = self.clone();
        view.overlay.push(scope);
        view
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn entity(&self) -> &str {
        self.schema.name()
    }

    /// The merged scope this view applies.
    pub fn active_scope(&self) -> Scope {
        let default = if self.include_default {
            self.schema.default_scope()
        } else {
            None
        };
        merge_scopes(default.into_iter().chain(self.overlay.iter()))
    }
}

/// Merge scopes in order.
///
/// Filters conjoin, attribute selections union, groups concatenate, order,
/// limit and offset take the last value set, and includes keep the last
/// entry per (target, alias).
pub fn merge_scopes<'a>(scopes: impl IntoIterator<Item = &'a Scope>) -> Scope {
    let mut merged = Scope::default();
    for scope in scopes {
        if let Some(filter) = &scope.filter {
            merged.filter = Some(Where::conjoin(merged.filter.take(), filter.clone()));
        }
        if let Some(attributes) = &scope.attributes {
            merged.attributes = Some(match &merged.attributes {
                Some(existing) => existing.merged(attributes),
                None => attributes.clone(),
            });
        }
        for field in &scope.group {
            if !merged.group.contains(field) {
                merged.group.push(field.clone());
            }
        }
        if !scope.order.is_empty() {
            merged.order.clone_from(&scope.order);
        }
        if scope.limit.is_some() {
            merged.limit = scope.limit;
        }
        if scope.offset.is_some() {
            merged.offset = scope.offset;
        }
        for include in &scope.include {
            if let Some(identity) = include.identity() {
                merged.include.retain(|existing| existing.identity() != Some(identity));
            }
            merged.include.push(include.clone());
        }
    }
    merged
}

/// Inject a scope into normalized root options.
///
/// The scope filter is conjoined ahead of the query's own; attributes,
/// order, group, limit and offset come from the scope only where the query
/// leaves them unset.
pub fn apply_scope(
    registry: &Registry,
    schema: &Schema,
    find: &mut NormalizedFind,
    scope: &Scope,
) -> Result<()> {
    if let Some(filter) = &scope.filter {
        find.filter = Some(scoped_filter(filter, find.filter.take()));
    }
    if find.attributes.is_none() {
        if let Some(selection) = &scope.attributes {
            find.attributes = Some(expand_attributes(schema, selection)?);
        }
    }
    if find.order.is_empty() {
        find.order.clone_from(&scope.order);
    }
    if find.group.is_empty() {
        find.group.clone_from(&scope.group);
    }
    find.limit = find.limit.or(scope.limit);
    find.offset = find.offset.or(scope.offset);
    merge_scope_includes(registry, schema, &mut find.include, scope)
}

/// Inject a target entity's scope into one include node.
pub fn apply_scope_to_include(
    registry: &Registry,
    schema: &Schema,
    include: &mut NormalizedInclude,
    scope: &Scope,
) -> Result<()> {
    if let Some(filter) = &scope.filter {
        include.filter = Some(scoped_filter(filter, include.filter.take()));
    }
    if include.attributes.is_none() {
        if let Some(selection) = &scope.attributes {
            include.attributes = Some(expand_attributes(schema, selection)?);
        }
    }
    if include.order.is_empty() {
        include.order.clone_from(&scope.order);
    }
    include.limit = include.limit.or(scope.limit);
    merge_scope_includes(registry, schema, &mut include.include, scope)
}

fn scoped_filter(scope_filter: &Where, own: Option<Where>) -> Where {
    match own {
        Some(own) => scope_filter.clone().and(own),
        None => scope_filter.clone(),
    }
}

/// Scope includes go after the query's own, later scope entries winning.
fn merge_scope_includes(
    registry: &Registry,
    schema: &Schema,
    includes: &mut Vec<NormalizedInclude>,
    scope: &Scope,
) -> Result<()> {
    if scope.include.is_empty() {
        return Ok(());
    }
    let scoped = normalize_includes(registry, schema, &scope.include)?;
    for include in scoped.into_iter().rev() {
        if includes.iter().any(|existing| existing.is_equivalent(&include)) {
            continue;
        }
        includes.push(include);
    }
    Ok(())
}

/// The `deleted_at IS NULL` predicate of a paranoid entity.
pub fn paranoid_clause(schema: &Schema) -> Option<Where> {
    schema.deleted_at().map(Where::is_null)
}

/// Conjoin deletion filtering into the root filter and into the filter of
/// every include (junction nodes included) whose entity is paranoid, unless
/// the caller switched it off for that level.
pub fn inject_paranoid(plan: &mut QueryPlan, registry: &Registry) -> Result<()> {
    if plan.paranoid {
        let root = registry.schema(&plan.model)?;
        if let Some(clause) = paranoid_clause(root) {
            plan.filter = Some(Where::conjoin(plan.filter.take(), clause));
        }
    }
    for node in plan.nodes_mut() {
        if !node.paranoid {
            continue;
        }
        let schema = registry.schema(&node.model)?;
        if let Some(clause) = paranoid_clause(schema) {
            node.filter = Some(Where::conjoin(node.filter.take(), clause));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{
        Association, AttributeDef, AttributeSelection, DataType, IncludeOptions, IncludeRequest,
        OrderBy, SchemaOptions,
    };

    fn registry() -> Registry {
        Registry::builder()
            .define(
                "Project",
                vec![
                    AttributeDef::new("name", DataType::Text),
                    AttributeDef::new("active", DataType::Boolean),
                    AttributeDef::new("x", DataType::Integer),
                    AttributeDef::new("owner_id", DataType::Integer),
                ],
                SchemaOptions::default()
                    .paranoid(true)
                    .default_scope(Scope::new().filter(Where::eq("active", true)))
                    .scope("small", Scope::new().filter(Where::lt("x", 10)).limit(5))
                    .scope(
                        "positive",
                        Scope::new()
                            .filter(Where::gt("x", 0))
                            .include(IncludeOptions::alias("owner").required(true)),
                    )
                    .scope(
                        "with_owner",
                        Scope::new().include(IncludeOptions::alias("owner").required(false)),
                    ),
            )
            .unwrap()
            .define(
                "Owner",
                vec![AttributeDef::new("name", DataType::Text)],
                SchemaOptions::default(),
            )
            .unwrap()
            .associate(Association::belongs_to("Project", "Owner", "owner_id").alias("owner"))
            .build()
            .unwrap()
    }

    #[test]
    fn default_scope_applies_until_unscoped() {
        let registry = registry();
        let view = ScopedView::new(Arc::clone(registry.schema("Project").unwrap()));
        assert_eq!(view.active_scope().filter, Some(Where::eq("active", true)));
        assert!(view.unscoped().active_scope().is_empty());
    }

    #[test]
    fn named_scopes_conjoin_filters() {
        let registry = registry();
        let view = ScopedView::new(Arc::clone(registry.schema("Project").unwrap()));
        let scoped = view.scope(&["small", "positive"]).unwrap();
        let active = scoped.active_scope();
        assert_eq!(
            active.filter,
            Some(Where::And(vec![Where::lt("x", 10), Where::gt("x", 0)]))
        );
        assert_eq!(active.limit, Some(5));

        let err = view.scope(&["missing"]).unwrap_err();
        assert!(err.to_string().contains("Invalid scope missing called."));
    }

    #[test]
    fn later_scope_include_wins() {
        let registry = registry();
        let schema = registry.schema("Project").unwrap();
        let scope = ScopedView::new(Arc::clone(schema))
            .scope(&["positive", "with_owner"])
            .unwrap()
            .active_scope();
        assert_eq!(scope.include.len(), 1);
        match &scope.include[0] {
            IncludeRequest::Node(node) => assert_eq!(node.required, Some(false)),
            other => panic!("unexpected include {other:?}"),
        }

        let mut find = NormalizedFind::unfiltered();
        apply_scope(&registry, schema, &mut find, &scope).unwrap();
        assert_eq!(find.include.len(), 1);
        assert_eq!(find.include[0].required, Some(false));
    }

    #[test]
    fn query_values_take_precedence() {
        let registry = registry();
        let schema = registry.schema("Project").unwrap();
        let scope = Scope::new()
            .filter(Where::eq("x", 1))
            .order(OrderBy::asc("name"))
            .limit(3)
            .attributes(AttributeSelection::fields(["name"]));
        let mut find = NormalizedFind::unfiltered();
        find.filter = Some(Where::eq("name", "a"));
        find.limit = Some(9);
        apply_scope(&registry, schema, &mut find, &scope).unwrap();
        assert_eq!(
            find.filter,
            Some(Where::And(vec![Where::eq("x", 1), Where::eq("name", "a")]))
        );
        assert_eq!(find.limit, Some(9));
        assert_eq!(find.order, vec![OrderBy::asc("name")]);
        assert_eq!(find.attributes, Some(vec!["name".to_string()]));
    }

    #[test]
    fn paranoid_clause_names_deleted_at() {
        let registry = registry();
        assert_eq!(
            paranoid_clause(registry.schema("Project").unwrap()),
            Some(Where::is_null("deleted_at"))
        );
        assert_eq!(paranoid_clause(registry.schema("Owner").unwrap()), None);
    }
}
