//! Goal gate enforcement at the exit sentinel.
//!
//! Stages flagged `goal_gate=true` must have settled at SUCCESS before the
//! pipeline may finish. An unsatisfied gate routes back to its retry target
//! (node attribute first, then the graph-level attribute) when one exists.

use indexmap::IndexMap;

use gantry_types::{Outcome, StageStatus};

use crate::graph::{Graph, Node};

#[derive(Debug)]
pub struct GoalGateResult {
    pub all_satisfied: bool,
    pub failed_node_id: Option<String>,
    pub retry_target: Option<String>,
}

/// Check whether all visited goal gate nodes have succeeded.
/// Only nodes that appear in `outcomes` (visited nodes) are checked.
pub fn check_goal_gates(graph: &Graph, outcomes: &IndexMap<String, Outcome>) -> GoalGateResult {
    for (node_id, outcome) in outcomes {
        if let Some(node) = graph.node(node_id) {
            if node.goal_gate && outcome.status != StageStatus::Success {
                return GoalGateResult {
                    all_satisfied: false,
                    failed_node_id: Some(node_id.clone()),
                    retry_target: resolve_retry_target(node, graph),
                };
            }
        }
    }
    GoalGateResult {
        all_satisfied: true,
        failed_node_id: None,
        retry_target: None,
    }
}

fn resolve_retry_target(node: &Node, graph: &Graph) -> Option<String> {
    node.retry_target.clone().or_else(|| graph.retry_target())
}
