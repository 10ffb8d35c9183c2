//! Turning flat joined rows back into record trees.
//!
//! Storage returns one row per join combination. Root records are grouped
//! by primary key, and each include level is grouped the same way under
//! its parent, so a parent joined to three children yields one record with
//! three related records rather than three records.

use std::collections::HashMap;
use std::sync::Arc;

use relmap_core::{AttachedInclude, Record, Registry, Related, Result, Row};
use relmap_query::{NodeId, QueryPlan};

/// Include trees to attach to records materialized from `plan`.
pub fn attached_includes(registry: &Registry, plan: &QueryPlan, ids: &[NodeId]) -> Result<Vec<AttachedInclude>> {
    let mut out = Vec::new();
    for id in ids {
        let node = plan.node(*id);
        if node.pseudo {
            continue;
        }
        out.push(AttachedInclude {
            alias: node.alias.clone(),
            association: Arc::clone(&node.association),
            schema: Arc::clone(registry.schema(&node.model)?),
            include: attached_includes(registry, plan, &node.children)?,
        });
    }
    Ok(out)
}

/// Materialize the rows of a planned select.
///
/// Raw plans give one record per row from the root columns alone.
/// Separate includes are left for the caller to fill.
pub fn hydrate(registry: &Registry, plan: &QueryPlan, rows: &[Row]) -> Result<Vec<Record>> {
    let schema = registry.schema(&plan.model)?;
    if plan.raw {
        return rows
            .iter()
            .map(|row| Record::from_row(schema, &row.root()))
            .collect();
    }

    let include = attached_includes(registry, plan, plan.roots())?;
    let mut records: Vec<Record> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let mut record = Record::from_row(schema, &row.root())?;
        record.set_include_tree(include.clone());
        let position = match record.identity_key() {
            Some(key) => *positions.entry(key).or_insert_with(|| {
                records.push(record);
                records.len() - 1
            }),
            None => {
                records.push(record);
                records.len() - 1
            }
        };
        attach(registry, plan, plan.roots(), &mut records[position], row)?;
    }
    tracing::trace!(model = %plan.model, rows = rows.len(), records = records.len(), "hydrated");
    Ok(records)
}

fn attach(registry: &Registry, plan: &QueryPlan, nodes: &[NodeId], record: &mut Record, row: &Row) -> Result<()> {
    for id in nodes {
        let node = plan.node(*id);
        if node.pseudo || node.separate {
            continue;
        }
        if record.related(&node.alias).is_none() {
            let empty = if node.association.is_single_valued() {
                Related::One(None)
            } else {
                Related::Many(Vec::new())
            };
            record.set_related(node.alias.clone(), empty);
        }

        let scoped = row.scoped(&plan.prefix(*id));
        if scoped.is_empty() || scoped.is_all_null() {
            continue;
        }
        let target = registry.schema(&node.model)?;
        let mut child = Record::from_row(target, &scoped)?;
        child.set_include_tree(attached_includes(registry, plan, &node.children)?);
        if let Some(pseudo) = plan.children(*id).find(|c| c.pseudo) {
            let link = row.scoped(&plan.prefix(pseudo.id));
            if !link.is_empty() && !link.is_all_null() {
                let junction = registry.schema(&pseudo.model)?;
                let link = Record::from_row(junction, &link)?;
                child.set_related(pseudo.alias.clone(), Related::One(Some(Box::new(link))));
            }
        }

        let Some(related) = record.related_mut(&node.alias) else {
            continue;
        };
        let slot: &mut Record = match related {
            Related::One(existing) => &mut **existing.get_or_insert_with(|| Box::new(child)),
            Related::Many(list) => {
                let key = child.identity_key();
                let found = key
                    .as_ref()
                    .and_then(|k| list.iter().position(|r| r.identity_key().as_ref() == Some(k)));
                match found {
                    Some(index) => &mut list[index],
                    None => {
                        list.push(child);
                        let last = list.len() - 1;
                        &mut list[last]
                    }
                }
            }
        };
        attach(registry, plan, &node.children, slot, row)?;
    }
    Ok(())
}
