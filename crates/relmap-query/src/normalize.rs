//! Option normalization.
//!
//! Every include shape converges to a [`NormalizedInclude`] naming its
//! target entity, attribute selections become concrete field lists, and
//! `all` includes are expanded against the parent's associations.

use std::sync::Arc;

use relmap_core::{
    Association, AttributeSelection, EagerLoadingErrorKind, Error, FindOptions, IncludeAll,
    IncludeOptions, IncludeRequest, OrderBy, Registry, Result, Schema, ThroughOptions, Where,
};

/// An include with its target entity resolved.
#[derive(Debug, Clone)]
pub struct NormalizedInclude {
    pub model: String,
    pub association: Option<Arc<Association>>,
    pub alias: Option<String>,
    pub filter: Option<Where>,
    pub attributes: Option<Vec<String>>,
    pub required: Option<bool>,
    pub separate: Option<bool>,
    pub limit: Option<u64>,
    pub order: Vec<OrderBy>,
    pub paranoid: bool,
    pub duplicating: Option<bool>,
    pub through: Option<ThroughOptions>,
    pub include: Vec<NormalizedInclude>,
}

impl NormalizedInclude {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            association: None,
            alias: None,
            filter: None,
            attributes: None,
            required: None,
            separate: None,
            limit: None,
            order: Vec::new(),
            paranoid: true,
            duplicating: None,
            through: None,
            include: Vec::new(),
        }
    }

    pub fn for_association(association: &Arc<Association>) -> Self {
        let mut node = Self::for_model(association.target.clone());
        node.alias = Some(association.alias.clone());
        node.association = Some(Arc::clone(association));
        node
    }

    /// Whether `other` requests the same edge: same target and, when both
    /// name one, the same alias.
    pub fn is_equivalent(&self, other: &NormalizedInclude) -> bool {
        self.model == other.model
            && match (&self.alias, &other.alias) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Find options after normalization.
#[derive(Debug, Clone)]
pub struct NormalizedFind {
    pub filter: Option<Where>,
    pub attributes: Option<Vec<String>>,
    pub include: Vec<NormalizedInclude>,
    pub order: Vec<OrderBy>,
    pub group: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub paranoid: bool,
    pub raw: bool,
}

impl NormalizedFind {
    /// A find with no options beyond deletion filtering.
    pub fn unfiltered() -> Self {
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
        }
    }
}

/// Normalize find options against the root entity.
#[tracing::instrument(level = "trace", skip_all, fields(model = %schema.name()))]
pub fn conform(registry: &Registry, schema: &Schema, options: &FindOptions) -> Result<NormalizedFind> {
    let attributes = options
        .attributes
        .as_ref()
        .map(|selection| expand_attributes(schema, selection))
        .transpose()?;
    let include = normalize_includes(registry, schema, &options.include)?;
    Ok(NormalizedFind {
        filter: options.filter.clone(),
        attributes,
        include,
        order: options.order.clone(),
        group: options.group.clone(),
        limit: options.limit,
        offset: options.offset,
        paranoid: options.paranoid,
        raw: options.raw,
    })
}

/// Normalize the includes requested under `parent`, expanding `all`
/// entries after the explicit ones.
pub fn normalize_includes(
    registry: &Registry,
    parent: &Schema,
    requests: &[IncludeRequest],
) -> Result<Vec<NormalizedInclude>> {
    let mut includes: Vec<NormalizedInclude> = Vec::new();
    let mut expansions: Vec<&IncludeAll> = Vec::new();

    for request in requests {
        match request {
            IncludeRequest::All(all) => expansions.push(all),
            IncludeRequest::Alias(path) => {
                let node = alias_path(registry, parent, path)?;
                merge_path(&mut includes, node);
            }
            IncludeRequest::Model(model) => {
                registry.schema(model).map_err(|_| unexpected_include())?;
                includes.push(NormalizedInclude::for_model(model.clone()));
            }
            IncludeRequest::Association(association) => {
                includes.push(NormalizedInclude::for_association(association));
            }
            IncludeRequest::Node(options) => {
                includes.push(normalize_node(registry, parent, options)?);
            }
        }
    }

    for all in expansions {
        let mut path = vec![parent.name().to_string()];
        expand_include_all(registry, parent, all, &mut includes, &mut path)?;
    }
    Ok(includes)
}

fn unexpected_include() -> Error {
    Error::request("Include unexpected. Element has to be either a Model, an Association or an object.")
}

fn alias_not_found(parent: &Schema, alias: &str) -> Error {
    Error::eager_loading(
        EagerLoadingErrorKind::NotAssociated,
        format!("Association with alias \"{alias}\" does not exist on {}", parent.name()),
    )
}

/// `"team.city"` becomes a `team` node with a nested `city` node.
fn alias_path(registry: &Registry, parent: &Schema, path: &str) -> Result<NormalizedInclude> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let association = parent
        .association(head)
        .ok_or_else(|| alias_not_found(parent, head))?;
    let mut node = NormalizedInclude::for_association(association);
    if let Some(rest) = rest {
        let target = registry.schema(&association.target)?;
        node.include.push(alias_path(registry, target, rest)?);
    }
    Ok(node)
}

/// Dotted paths sharing a prefix collapse into one node.
fn merge_path(includes: &mut Vec<NormalizedInclude>, node: NormalizedInclude) {
    let existing = includes
        .iter_mut()
        .find(|i| i.model == node.model && i.alias == node.alias);
    match existing {
        Some(existing) => {
            for child in node.include {
                merge_path(&mut existing.include, child);
            }
        }
        None => includes.push(node),
    }
}

fn normalize_node(
    registry: &Registry,
    parent: &Schema,
    options: &IncludeOptions,
) -> Result<NormalizedInclude> {
    let (model, association) = match (&options.model, &options.association, &options.alias) {
        (_, Some(association), _) => (association.target.clone(), Some(Arc::clone(association))),
        (Some(model), None, _) => {
            registry.schema(model).map_err(|_| unexpected_include())?;
            (model.clone(), None)
        }
        (None, None, Some(alias)) => {
            let association = parent
                .association(alias)
                .ok_or_else(|| alias_not_found(parent, alias))?;
            (association.target.clone(), Some(Arc::clone(association)))
        }
        (None, None, None) => return Err(unexpected_include()),
    };
    let target = registry.schema(&model)?;

    let attributes = options
        .attributes
        .as_ref()
        .map(|selection| expand_attributes(target, selection))
        .transpose()?;
    let alias = options
        .alias
        .clone()
        .or_else(|| association.as_ref().map(|a| a.alias.clone()));

    Ok(NormalizedInclude {
        model,
        association,
        alias,
        filter: options.filter.clone(),
        attributes,
        required: options.required,
        separate: options.separate,
        limit: options.limit,
        order: options.order.clone(),
        paranoid: options.paranoid.unwrap_or(true),
        duplicating: options.duplicating,
        through: options.through.clone(),
        include: normalize_includes(registry, target, &options.include)?,
    })
}

/// Turn an attribute selection into a concrete field list.
///
/// `Fields` must name declared attributes; virtual ones are dropped since
/// they have no column. `Adjust` starts from every persisted attribute.
pub fn expand_attributes(schema: &Schema, selection: &AttributeSelection) -> Result<Vec<String>> {
    let check = |name: &String| -> Result<()> {
        if schema.has_attribute(name) {
            Ok(())
        } else {
            Err(Error::request(format!(
                "Unknown attribute '{name}' on {}",
                schema.name()
            )))
        }
    };
    match selection {
        AttributeSelection::Fields(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for field in fields {
                check(field)?;
                if !schema.is_virtual(field) && !out.contains(field) {
                    out.push(field.clone());
                }
            }
            Ok(out)
        }
        AttributeSelection::Adjust { include, exclude } => {
            let mut out: Vec<String> = schema
                .persisted_fields()
                .into_iter()
                .filter(|f| !exclude.contains(f))
                .collect();
            for field in include {
                check(field)?;
                if !schema.is_virtual(field) && !out.contains(field) {
                    out.push(field.clone());
                }
            }
            Ok(out)
        }
    }
}

/// Append an include for every association of `parent` admitted by `all`
/// that is not already included.
///
/// With `nested`, each added include is expanded in turn; a target already
/// on the current path is not entered again.
pub fn expand_include_all(
    registry: &Registry,
    parent: &Schema,
    all: &IncludeAll,
    includes: &mut Vec<NormalizedInclude>,
    path: &mut Vec<String>,
) -> Result<()> {
    for association in parent.associations() {
        if !all.admits(association.kind) {
            continue;
        }
        let candidate = NormalizedInclude::for_association(association);
        if includes.iter().any(|i| i.is_equivalent(&candidate)) {
            continue;
        }
        if all.nested && path.contains(&association.target) {
            tracing::trace!(
                parent = parent.name(),
                target = %association.target,
                "include all: target already on path, not descending"
            );
            continue;
        }
        let mut node = candidate;
        if all.nested {
            let target = registry.schema(&association.target)?;
            path.push(association.target.clone());
            let expanded = expand_include_all(registry, target, all, &mut node.include, path);
            path.pop();
            expanded?;
        }
        includes.push(node);
    }
    Ok(())
}
