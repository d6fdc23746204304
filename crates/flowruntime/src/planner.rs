//! Turns a workflow definition into the fixed sequential plan of a run.

use flowcore::{ExecutionId, NodeExecution, NodeSpec, RetryPolicy, Workflow, WorkflowError};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// One node of the plan.
#[derive(Debug, Clone)]
pub struct PlannedNode<'a> {
    pub spec: &'a NodeSpec,
    pub execution_order: u32,
    /// Distinct upstream node keys, recorded for reference only.
    pub dependencies: Vec<String>,
}

/// Build the dependency graph of a workflow, indexed by declaration position.
fn build_graph(workflow: &Workflow) -> Result<DiGraph<usize, ()>, WorkflowError> {
    let mut graph = DiGraph::new();
    let mut key_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for (position, node) in workflow.nodes.iter().enumerate() {
        if key_to_index.contains_key(node.key.as_str()) {
            return Err(WorkflowError::Invalid(format!("duplicate node key '{}'", node.key)));
        }
        let idx = graph.add_node(position);
        key_to_index.insert(node.key.as_str(), idx);
    }

    for conn in &workflow.connections {
        let from = key_to_index.get(conn.from_node.as_str()).ok_or_else(|| {
            WorkflowError::InvalidConnection(format!("unknown source node '{}'", conn.from_node))
        })?;
        let to = key_to_index.get(conn.to_node.as_str()).ok_or_else(|| {
            WorkflowError::InvalidConnection(format!("unknown target node '{}'", conn.to_node))
        })?;
        graph.add_edge(*from, *to, ());
    }

    if is_cyclic_directed(&graph) {
        return Err(WorkflowError::CyclicDependency);
    }
    Ok(graph)
}

/// Order the workflow's nodes for sequential execution: a topological order
/// of the connections where declaration order breaks ties.
pub fn plan(workflow: &Workflow) -> Result<Vec<PlannedNode<'_>>, WorkflowError> {
    if workflow.nodes.is_empty() {
        return Err(WorkflowError::Invalid("workflow has no nodes".to_string()));
    }
    let graph = build_graph(workflow)?;

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = graph
        .node_indices()
        .filter(|idx| in_degree[idx] == 0)
        .map(|idx| Reverse((graph[idx], idx)))
        .collect();

    let mut planned = Vec::with_capacity(workflow.nodes.len());
    while let Some(Reverse((position, idx))) = ready.pop() {
        let spec = &workflow.nodes[position];
        let mut dependencies: Vec<String> = Vec::new();
        for conn in workflow.incoming(&spec.key) {
            if !dependencies.contains(&conn.from_node) {
                dependencies.push(conn.from_node.clone());
            }
        }
        planned.push(PlannedNode {
            spec,
            execution_order: planned.len() as u32,
            dependencies,
        });

        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph[next], next)));
                }
            }
        }
    }

    if planned.len() != workflow.nodes.len() {
        return Err(WorkflowError::CyclicDependency);
    }
    Ok(planned)
}

/// Effective retry policy of a node: its own, else the workflow default,
/// else no retries with `default_delay_ms` between attempts.
pub fn retry_policy_for(workflow: &Workflow, spec: &NodeSpec, default_delay_ms: u64) -> RetryPolicy {
    spec.retry_policy
        .clone()
        .or_else(|| workflow.settings.node_retry.clone())
        .unwrap_or(RetryPolicy {
            max_retries: 0,
            delay_ms: default_delay_ms,
        })
}

/// Create the `PENDING` node records of a run from its plan.
pub fn node_executions(
    execution_id: ExecutionId,
    workflow: &Workflow,
    planned: &[PlannedNode<'_>],
    default_delay_ms: u64,
) -> Vec<NodeExecution> {
    planned
        .iter()
        .map(|p| NodeExecution {
            max_retries: retry_policy_for(workflow, p.spec, default_delay_ms).max_retries,
            dependencies: p.dependencies.clone(),
            ..NodeExecution::new(execution_id, p.spec, p.execution_order)
        })
        .collect()
}
