//! The resolved query plan.
//!
//! Include nodes live in an arena owned by the [`QueryPlan`] and refer to
//! each other through [`NodeId`]s, so every derived flag can be read or
//! rewritten without aliasing parent and child.

use std::sync::Arc;

use relmap_core::{Association, OrderBy, Where};
use serde::{Deserialize, Serialize};

/// Index of an include node within its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// One planned eager load.
#[derive(Debug, Clone)]
pub struct IncludeNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// Target entity
    pub model: String,
    /// Alias under which rows and related records are keyed
    pub alias: String,
    pub association: Arc<Association>,
    /// Junction rows of a many-to-many include; never surfaced as records
    pub pseudo: bool,
    /// Join condition on the target (scope, association scope and deletion
    /// filtering included)
    pub filter: Option<Where>,
    pub attributes: Vec<String>,
    /// Inner-join semantics: parents without a match are dropped
    pub required: bool,
    /// Fetched by a follow-up query rather than joined
    pub separate: bool,
    /// Joining this node can repeat parent rows
    pub duplicating: bool,
    /// Joined inside the limited parent subquery
    pub sub_query: bool,
    /// Filters the parent subquery without being joined into it
    pub sub_query_filter: bool,
    pub has_duplicating: bool,
    pub has_required: bool,
    pub has_parent_required: bool,
    pub has_parent_where: bool,
    pub limit: Option<u64>,
    pub order: Vec<OrderBy>,
    pub paranoid: bool,
    pub children: Vec<NodeId>,
}

/// Per-parent limit of a separately fetched include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedLimit {
    /// Foreign key attribute rows are grouped by
    pub on: String,
    pub limit: u64,
}

/// A fully resolved find: root options plus the include tree.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub model: String,
    pub filter: Option<Where>,
    pub attributes: Vec<String>,
    pub order: Vec<OrderBy>,
    pub group: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Limit applies to a subquery over root rows, joins outside it
    pub sub_query: bool,
    pub has_duplicating: bool,
    pub has_required: bool,
    pub has_multi_association: bool,
    pub has_single_association: bool,
    pub paranoid: bool,
    pub raw: bool,
    pub grouped_limit: Option<GroupedLimit>,
    nodes: Vec<IncludeNode>,
    roots: Vec<NodeId>,
}

impl QueryPlan {
    /// A plan with no includes.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filter: None,
            attributes: Vec::new(),
            order: Vec::new(),
            group: Vec::new(),
            limit: None,
            offset: None,
            sub_query: false,
            has_duplicating: false,
            has_required: false,
            has_multi_association: false,
            has_single_association: false,
            paranoid: true,
            raw: false,
            grouped_limit: None,
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub(crate) fn push_node(&mut self, mut node: IncludeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        match node.parent {
            Some(parent) => self.nodes[parent.0].children.push(id),
            None => self.roots.push(id),
        }
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &IncludeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut IncludeNode {
        &mut self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[IncludeNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut IncludeNode> {
        self.nodes.iter_mut()
    }

    /// Top-level includes in declaration order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn has_includes(&self) -> bool {
        !self.roots.is_empty()
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &IncludeNode> {
        self.nodes[id.0].children.iter().map(|c| &self.nodes[c.0])
    }

    /// Aliases from the root down to `id`.
    pub fn path(&self, id: NodeId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.0];
            path.push(node.alias.as_str());
            cursor = node.parent;
        }
        path.reverse();
        path
    }

    /// Dotted column prefix of a node's attributes in joined rows.
    pub fn prefix(&self, id: NodeId) -> String {
        self.path(id).join(".")
    }

    pub fn find_by_path(&self, path: &[&str]) -> Option<NodeId> {
        let mut level: &[NodeId] = &self.roots;
        let mut found = None;
        for alias in path {
            let id = *level.iter().find(|id| self.nodes[id.0].alias == *alias)?;
            found = Some(id);
            level = &self.nodes[id.0].children;
        }
        found
    }

    /// Whether `id` or one of its ancestors is fetched separately.
    pub fn is_detached(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.0];
            if node.separate {
                return true;
            }
            cursor = node.parent;
        }
        false
    }

    /// Separate nodes whose parent is joined into this plan's rows.
    pub fn separate_roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.separate && n.parent.is_none_or(|p| !self.is_detached(p)))
            .map(|n| n.id)
            .collect()
    }

    /// Standalone plan for a separate node: the node becomes the root and
    /// its descendants are re-indexed under it.
    pub fn extract_subtree(&self, id: NodeId) -> QueryPlan {
        let node = &self.nodes[id.0];
        let mut plan = QueryPlan::new(node.model.clone());
        plan.filter.clone_from(&node.filter);
        plan.attributes.clone_from(&node.attributes);
        plan.order.clone_from(&node.order);
        plan.paranoid = false;
        plan.raw = false;
        plan.has_required = node.has_required;
        plan.has_duplicating = node.children.iter().any(|c| self.nodes[c.0].has_duplicating);
        plan.grouped_limit = node.limit.map(|limit| GroupedLimit {
            on: node.association.foreign_key.clone(),
            limit,
        });
        for child in &node.children {
            self.copy_subtree(*child, None, &mut plan);
        }
        plan.has_multi_association = plan.nodes.iter().any(|n| !n.pseudo && n.association.is_multi_valued());
        plan.has_single_association = plan.nodes.iter().any(|n| !n.pseudo && n.association.is_single_valued());
        plan.sub_query = false;
        plan
    }

    fn copy_subtree(&self, id: NodeId, parent: Option<NodeId>, into: &mut QueryPlan) {
        let mut node = self.nodes[id.0].clone();
        node.parent = parent;
        node.children = Vec::new();
        let new_id = into.push_node(node);
        for child in &self.nodes[id.0].children {
            self.copy_subtree(*child, Some(new_id), into);
        }
    }
}
