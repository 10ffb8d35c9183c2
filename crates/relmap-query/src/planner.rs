//! Include planning.
//!
//! [`IncludePlanner::validate`] turns normalized find options into a
//! [`QueryPlan`]: associations are resolved, junction nodes synthesized,
//! attribute lists completed and the join/subquery flags decided. The
//! planner never mutates its input.

use std::sync::Arc;

use relmap_core::{
    Association, AssociationKind, EagerLoadingErrorKind, Error, Registry, Result, Schema,
    SchemaErrorKind, Where,
};

use crate::normalize::{NormalizedFind, NormalizedInclude};
use crate::plan::{IncludeNode, NodeId, QueryPlan};
use crate::scope::{apply_scope_to_include, inject_paranoid};

/// State inherited from the ancestors of a sibling group.
#[derive(Debug, Clone, Copy)]
struct Context {
    /// Limit of the query this group is joined into
    top_limit: Option<u64>,
    has_parent_required: bool,
    has_parent_where: bool,
}

/// Flags accumulated over one sibling group.
#[derive(Debug, Default, Clone, Copy)]
struct Level {
    has_duplicating: bool,
    has_required: bool,
}

/// Resolves include trees against a registry.
#[derive(Debug, Clone, Copy)]
pub struct IncludePlanner<'r> {
    registry: &'r Registry,
}

impl<'r> IncludePlanner<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Plan a find on `schema`.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %schema.name()))]
    pub fn validate(&self, find: &NormalizedFind, schema: &Arc<Schema>) -> Result<QueryPlan> {
        let mut plan = QueryPlan::new(schema.name());
        plan.filter.clone_from(&find.filter);
        plan.order.clone_from(&find.order);
        plan.group.clone_from(&find.group);
        plan.limit = find.limit;
        plan.offset = find.offset;
        plan.paranoid = find.paranoid;
        plan.raw = find.raw;

        let mut attributes = find
            .attributes
            .clone()
            .unwrap_or_else(|| schema.persisted_fields());
        let ctx = Context {
            top_limit: find.limit,
            has_parent_required: false,
            has_parent_where: find.filter.is_some(),
        };
        let level = self.plan_level(&mut plan, None, schema, &find.include, ctx, &mut attributes)?;
        plan.has_duplicating = level.has_duplicating;
        plan.has_required = level.has_required;

        if find.limit.is_some() {
            plan.sub_query = plan.roots().iter().any(|id| {
                let node = plan.node(*id);
                !node.separate && (node.sub_query || node.has_duplicating)
            });
        }

        let joined: Vec<&IncludeNode> = plan
            .nodes()
            .iter()
            .filter(|n| !n.pseudo && !plan.is_detached(n.id))
            .collect();
        let has_multi = joined.iter().any(|n| n.association.is_multi_valued());
        let has_single = joined.iter().any(|n| n.association.is_single_valued());
        plan.has_multi_association = has_multi;
        plan.has_single_association = has_single;

        if plan.has_includes() && !find.raw {
            force_fields(&mut attributes, schema.primary_keys());
        }
        plan.attributes = attributes;

        inject_paranoid(&mut plan, self.registry)?;
        tracing::debug!(
            sub_query = plan.sub_query,
            has_duplicating = plan.has_duplicating,
            has_required = plan.has_required,
            includes = plan.nodes().len(),
            "planned find"
        );
        Ok(plan)
    }

    fn plan_level(
        &self,
        plan: &mut QueryPlan,
        parent: Option<NodeId>,
        parent_schema: &Schema,
        includes: &[NormalizedInclude],
        ctx: Context,
        parent_attributes: &mut Vec<String>,
    ) -> Result<Level> {
        let mut level = Level::default();
        let mut ids = Vec::with_capacity(includes.len());
        for include in includes {
            let id = self.plan_node(plan, parent, parent_schema, include, ctx, parent_attributes)?;
            let node = plan.node(id);
            level.has_duplicating |= node.has_duplicating;
            level.has_required |= node.required;
            ids.push(id);
        }

        for id in ids {
            let node = plan.node_mut(id);
            let (sub_query, sub_query_filter) = if node.separate {
                (false, false)
            } else {
                match ctx.top_limit {
                    Some(_) if level.has_duplicating => {
                        if node.duplicating {
                            (false, node.has_required)
                        } else {
                            (node.has_required, false)
                        }
                    }
                    Some(_) => (node.has_parent_required && node.has_required, false),
                    None => (false, false),
                }
            };
            node.sub_query = sub_query;
            node.sub_query_filter = sub_query_filter;
            tracing::debug!(
                alias = %node.alias,
                required = node.required,
                duplicating = node.duplicating,
                separate = node.separate,
                sub_query,
                sub_query_filter,
                "planned include"
            );
        }
        Ok(level)
    }

    fn plan_node(
        &self,
        plan: &mut QueryPlan,
        parent: Option<NodeId>,
        parent_schema: &Schema,
        include: &NormalizedInclude,
        ctx: Context,
        parent_attributes: &mut Vec<String>,
    ) -> Result<NodeId> {
        let association = resolve_association(parent_schema, include)?;
        let target = self.registry.schema(&association.target)?;

        let mut include = include.clone();
        if let Some(scope) = target.default_scope() {
            apply_scope_to_include(self.registry, target, &mut include, scope)?;
        }

        let mut attributes = include
            .attributes
            .clone()
            .unwrap_or_else(|| target.persisted_fields());
        force_fields(&mut attributes, target.primary_keys());

        let required = include.required.unwrap_or(include.filter.is_some());
        let filter = match &association.scope {
            Some(scope) => Some(Where::conjoin(include.filter.take(), scope.clone())),
            None => include.filter.take(),
        };

        let separate = include.separate.unwrap_or(include.limit.is_some());
        if separate && association.kind != AssociationKind::OneToMany {
            return Err(Error::eager_loading(
                EagerLoadingErrorKind::InvalidSeparate,
                format!(
                    "Only HasMany associations support include.separate ({}.{} is {})",
                    association.source,
                    association.alias,
                    association.kind.as_str()
                ),
            ));
        }
        let duplicating = if separate {
            false
        } else {
            include
                .duplicating
                .unwrap_or_else(|| association.is_multi_valued())
        };
        if separate {
            force_fields(&mut attributes, &[association.foreign_key.clone()]);
            force_fields(parent_attributes, &[association.source_key_name().to_string()]);
        }

        let has_filter = filter.is_some();
        let id = plan.push_node(IncludeNode {
            id: NodeId(0),
            parent,
            model: association.target.clone(),
            alias: association.alias.clone(),
            association: Arc::clone(&association),
            pseudo: false,
            filter,
            attributes: Vec::new(),
            required,
            separate,
            duplicating,
            sub_query: false,
            sub_query_filter: false,
            has_duplicating: false,
            has_required: false,
            has_parent_required: ctx.has_parent_required,
            has_parent_where: ctx.has_parent_where,
            limit: include.limit,
            order: include.order.clone(),
            paranoid: include.paranoid,
            children: Vec::new(),
        });

        let child_ctx = if separate {
            Context {
                top_limit: include.limit,
                has_parent_required: false,
                has_parent_where: true,
            }
        } else {
            Context {
                top_limit: ctx.top_limit,
                has_parent_required: ctx.has_parent_required || required,
                has_parent_where: ctx.has_parent_where || has_filter,
            }
        };
        let children = self.plan_level(plan, Some(id), target, &include.include, child_ctx, &mut attributes)?;

        if association.kind == AssociationKind::ManyToMany {
            self.plan_through(plan, id, &association, &include, child_ctx)?;
        }

        let node = plan.node_mut(id);
        node.attributes = attributes;
        node.has_duplicating = !separate && (duplicating || children.has_duplicating);
        node.has_required = required || children.has_required;
        Ok(id)
    }

    /// Hidden junction node of a many-to-many include, appended after the
    /// node's own children.
    fn plan_through(
        &self,
        plan: &mut QueryPlan,
        owner: NodeId,
        association: &Arc<Association>,
        include: &NormalizedInclude,
        ctx: Context,
    ) -> Result<NodeId> {
        let Some(through) = association.through.as_ref() else {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "{}.{}: many-to-many association has no junction entity",
                    association.source, association.alias
                ),
            ));
        };
        let junction = self.registry.schema(&through.model)?;
        let options = include.through.clone().unwrap_or_default();

        let mut filter = options.filter;
        if let Some(scope) = &through.scope {
            filter = Some(Where::conjoin(filter, scope.clone()));
        }
        if let Some(scope_filter) = junction.default_scope().and_then(|s| s.filter.clone()) {
            filter = Some(Where::conjoin(filter, scope_filter));
        }
        let mut attributes = options
            .attributes
            .unwrap_or_else(|| junction.persisted_fields());
        force_fields(&mut attributes, junction.primary_keys());

        Ok(plan.push_node(IncludeNode {
            id: NodeId(0),
            parent: Some(owner),
            model: through.model.clone(),
            alias: through.model.clone(),
            association: Arc::clone(association),
            pseudo: true,
            filter,
            attributes,
            required: false,
            separate: false,
            duplicating: false,
            sub_query: false,
            sub_query_filter: false,
            has_duplicating: false,
            has_required: false,
            has_parent_required: ctx.has_parent_required,
            has_parent_where: ctx.has_parent_where,
            limit: None,
            order: Vec::new(),
            paranoid: options.paranoid.unwrap_or(include.paranoid),
            children: Vec::new(),
        }))
    }
}

fn force_fields(attributes: &mut Vec<String>, fields: &[String]) {
    for field in fields {
        if !attributes.contains(field) {
            attributes.push(field.clone());
        }
    }
}

/// Find the association an include refers to.
///
/// A single association between the two entities is used whatever the
/// alias; several need the alias to pick one.
fn resolve_association(parent: &Schema, include: &NormalizedInclude) -> Result<Arc<Association>> {
    let not_associated = || {
        Error::eager_loading(
            EagerLoadingErrorKind::NotAssociated,
            format!("{} is not associated to {}!", include.model, parent.name()),
        )
    };

    if let Some(association) = &include.association {
        if association.source != parent.name() {
            return Err(not_associated());
        }
        if let Some(alias) = include.alias.as_deref() {
            if alias != association.alias {
                return Err(alias_mismatch(parent, include, alias, &[association]));
            }
        }
        return Ok(Arc::clone(association));
    }

    let candidates = parent.associations_to(&include.model);
    match (candidates.as_slice(), include.alias.as_deref()) {
        ([], _) => Err(not_associated()),
        ([only], None) => Ok(Arc::clone(only)),
        ([only], Some(alias)) => {
            if only.alias == alias {
                Ok(Arc::clone(only))
            } else {
                Err(alias_mismatch(parent, include, alias, &candidates))
            }
        }
        (many, Some(alias)) => many
            .iter()
            .find(|a| a.alias == alias)
            .map(|a| Arc::clone(a))
            .ok_or_else(|| ambiguous(parent, include)),
        (_, None) => Err(ambiguous(parent, include)),
    }
}

fn alias_mismatch(
    parent: &Schema,
    include: &NormalizedInclude,
    alias: &str,
    candidates: &[&Arc<Association>],
) -> Error {
    let existing: Vec<&str> = candidates.iter().map(|a| a.alias.as_str()).collect();
    Error::eager_loading(
        EagerLoadingErrorKind::AliasMismatch,
        format!(
            "{} is associated to {} using an alias. You've included an alias ({alias}), but it does not match the alias(es) defined in your association ({}).",
            include.model,
            parent.name(),
            existing.join(", ")
        ),
    )
}

fn ambiguous(parent: &Schema, include: &NormalizedInclude) -> Error {
    Error::eager_loading(
        EagerLoadingErrorKind::AmbiguousAlias,
        format!(
            "{} is associated to {} multiple times. To identify the correct association, you must use the 'as' keyword to specify the alias of the association you want to include.",
            include.model,
            parent.name()
        ),
    )
}
