//! The execution plan: an arena of nodes describing which subgraph
//! operations run, in which order, and where their results merge.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::json_ext::Path;
use crate::operation::{Directive, Operation, OperationKind, Selection};
use crate::supergraph::Supergraph;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Clone, Debug, PartialEq)]
pub enum PlanNode {
    Fetch(FetchNode),
    Flatten(FlattenNode),
    /// Children run concurrently and their results are merged.
    Parallel { nodes: Vec<NodeId> },
    /// Children run in order, each seeing the merged results of the previous.
    Sequence { nodes: Vec<NodeId> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchNode {
    pub service_name: String,
    pub operation: String,
    pub operation_name: Option<String>,
    pub operation_kind: OperationKind,
    pub variable_usages: Vec<String>,
    /// Key fields per entity type. Empty for root fetches.
    pub requires: IndexMap<String, Vec<String>>,
}

impl FetchNode {
    pub fn is_entity_fetch(&self) -> bool {
        !self.requires.is_empty()
    }
}

/// Response key of an entity key field the planner adds to a fetch.
/// Client aliases can't start with `__`, so it never shadows a client field.
pub(crate) fn key_alias(field: &str) -> String {
    format!("__key_{field}")
}

/// Runs `node` against the objects found at `path`.
#[derive(Clone, Debug, PartialEq)]
pub struct FlattenNode {
    pub path: Path,
    pub node: NodeId,
}

pub struct ExecutionPlan {
    pub(crate) nodes: Vec<PlanNode>,
    pub(crate) root: Option<NodeId>,
    pub(crate) operation: Arc<Operation>,
    pub(crate) schema: Arc<Supergraph>,
}

impl ExecutionPlan {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &PlanNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn fetches(&self) -> impl Iterator<Item = &FetchNode> {
        self.nodes.iter().filter_map(|node| match node {
            PlanNode::Fetch(fetch) => Some(fetch),
            _ => None,
        })
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn schema(&self) -> &Arc<Supergraph> {
        &self.schema
    }

    pub fn schema_version(&self) -> u64 {
        self.schema.version()
    }

    fn write_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self.node(id) {
            PlanNode::Fetch(fetch) => {
                writeln!(f, "{pad}Fetch(service: \"{}\") {{", fetch.service_name)?;
                writeln!(f, "{pad}  {}", fetch.operation)?;
                writeln!(f, "{pad}}},")
            }
            PlanNode::Flatten(flatten) => {
                writeln!(f, "{pad}Flatten(path: \"{}\") {{", flatten.path)?;
                self.write_node(f, flatten.node, indent + 1)?;
                writeln!(f, "{pad}}},")
            }
            PlanNode::Parallel { nodes } | PlanNode::Sequence { nodes } => {
                let label = match self.node(id) {
                    PlanNode::Parallel { .. } => "Parallel",
                    _ => "Sequence",
                };
                writeln!(f, "{pad}{label} {{")?;
                for node in nodes {
                    self.write_node(f, *node, indent + 1)?;
                }
                writeln!(f, "{pad}}},")
            }
        }
    }
}

impl PartialEq for ExecutionPlan {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.nodes == other.nodes
            && self.schema.version() == other.schema.version()
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("schema_version", &self.schema.version())
            .field("root", &self.root)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "QueryPlan {{")?;
        if let Some(root) = self.root {
            self.write_node(f, root, 1)?;
        }
        write!(f, "}}")
    }
}

/// Prints a selection set in compact GraphQL syntax, braces included.
pub(crate) fn write_selection_set(selections: &[Selection], out: &mut String) {
    out.push('{');
    for (i, selection) in selections.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match selection {
            Selection::Field(field) => {
                if let Some(alias) = &field.alias {
                    out.push_str(alias);
                    out.push(':');
                }
                out.push_str(&field.name);
                if !field.arguments.is_empty() {
                    out.push('(');
                    for (j, argument) in field.arguments.iter().enumerate() {
                        if j > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{}:{}", argument.name, argument.value);
                    }
                    out.push(')');
                }
                write_directives(&field.directives, out);
                if !field.selections.is_empty() {
                    write_selection_set(&field.selections, out);
                }
            }
            Selection::InlineFragment(fragment) => {
                out.push_str("...");
                if let Some(condition) = &fragment.type_condition {
                    out.push_str("on ");
                    out.push_str(condition);
                }
                write_directives(&fragment.directives, out);
                write_selection_set(&fragment.selections, out);
            }
        }
    }
    out.push('}');
}

fn write_directives(directives: &[Directive], out: &mut String) {
    for directive in directives {
        out.push_str(" @");
        out.push_str(&directive.name);
        if !directive.arguments.is_empty() {
            out.push('(');
            for (i, argument) in directive.arguments.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:{}", argument.name, argument.value);
            }
            out.push(')');
        }
    }
}
