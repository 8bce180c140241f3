use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use colony_domain::{
    ensure_non_empty, validate_identifier, ColonyError, WorkflowEdge, WorkflowNode, END_NODE,
    START_NODE,
};
use serde::{Deserialize, Serialize};

/// Authoring form of a workflow, as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

/// Load and validate a workflow document from disk.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_workflow_from_path(path: &Path) -> Result<WorkflowDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    parse_workflow_yaml(&content)
}

/// # Errors
/// Returns an error when YAML parsing or validation fails.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDocument> {
    let mut document: WorkflowDocument = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid workflow YAML structure: {err}"))?;
    document.name = document.name.trim().to_string();
    validate_definition(&document.name, &document.nodes, &document.edges)?;
    Ok(document)
}

/// Structural checks applied before a workflow is persisted.
///
/// # Errors
/// Returns [`ColonyError::Validation`] for bad identifiers, duplicate node
/// ids, dangling edges or cycles.
pub fn validate_definition(
    name: &str,
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<(), ColonyError> {
    validate_identifier("workflow_name", name)?;
    if nodes.is_empty() {
        return Err(ColonyError::Validation(format!(
            "workflow {name} has no nodes"
        )));
    }

    let mut node_ids = BTreeSet::new();
    for node in nodes {
        validate_identifier("node_id", &node.id)?;
        ensure_non_empty("node_name", &node.name)?;
        if !node_ids.insert(node.id.as_str()) {
            return Err(ColonyError::Validation(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
    }

    for edge in edges {
        if edge.from != START_NODE && !node_ids.contains(edge.from.as_str()) {
            return Err(ColonyError::Validation(format!(
                "edge {} -> {} starts at unknown node",
                edge.from, edge.to
            )));
        }
        if edge.to != END_NODE && !node_ids.contains(edge.to.as_str()) {
            return Err(ColonyError::Validation(format!(
                "edge {} -> {} ends at unknown node",
                edge.from, edge.to
            )));
        }
    }

    topological_order(nodes, edges).map(|_| ())
}

/// Dispatch order: rounds of ready nodes, each round in declaration order.
///
/// # Errors
/// Returns [`ColonyError::Validation`] naming the nodes caught in a cycle.
pub fn topological_order(
    nodes: &[WorkflowNode],
    edges: &[WorkflowEdge],
) -> Result<Vec<String>, ColonyError> {
    let index: BTreeMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id.as_str(), idx))
        .collect();

    let mut remaining: BTreeMap<usize, BTreeSet<usize>> =
        (0..nodes.len()).map(|idx| (idx, BTreeSet::new())).collect();
    for edge in edges {
        let (Some(from), Some(to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        else {
            continue;
        };
        if let Some(deps) = remaining.get_mut(to) {
            deps.insert(*from);
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    loop {
        let ready: Vec<usize> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(idx, _)| *idx)
            .collect();
        if ready.is_empty() {
            break;
        }

        for idx in ready {
            remaining.remove(&idx);
            for deps in remaining.values_mut() {
                deps.remove(&idx);
            }
            order.push(nodes[idx].id.clone());
        }
    }

    if remaining.is_empty() {
        return Ok(order);
    }

    let keys: Vec<&str> = remaining
        .keys()
        .map(|idx| nodes[*idx].id.as_str())
        .collect();
    Err(ColonyError::Validation(format!(
        "workflow cycle detected among nodes: {}",
        keys.join(", ")
    )))
}
