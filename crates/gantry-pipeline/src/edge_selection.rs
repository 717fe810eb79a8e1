//! Edge selection after a node settles.
//!
//! Priority cascade for a completed node: condition-matching edges first,
//! then a preferred-label match (how human answers route), then the
//! unconditional edges, picking by highest weight with lexically-smallest
//! target as the tiebreak. Failed nodes route through their own cascade
//! ending at tagged retry back-edges and the graph-level retry target.

use gantry_types::Outcome;

use crate::condition::{evaluate, parse_condition};
use crate::graph::{Edge, EdgeKind, Graph};

/// Select the single next edge to follow after a node completes.
/// Returns `None` for a terminal node.
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a Graph,
) -> Option<&'a Edge> {
    let candidates = forward_edges(graph, node_id);
    if candidates.is_empty() {
        return None;
    }

    // Step 1: condition-matching edges.
    let matching: Vec<&Edge> = candidates
        .iter()
        .copied()
        .filter(|e| edge_condition_matches(e, resolve))
        .collect();
    if !matching.is_empty() {
        return Some(best_by_weight_then_lexical(&matching));
    }

    // Step 2: preferred-label match.
    if let Some(ref label) = outcome.preferred_label {
        let wanted = normalize_label(label);
        for edge in &candidates {
            if let Some(ref elabel) = edge.label {
                if normalize_label(elabel) == wanted {
                    return Some(edge);
                }
            }
        }
    }

    // Step 3: unconditional edges by weight, lexical target tiebreak.
    let unconditional: Vec<&Edge> = candidates
        .iter()
        .copied()
        .filter(|e| e.condition.is_none())
        .collect();
    if unconditional.is_empty() {
        return None;
    }
    Some(best_by_weight_then_lexical(&unconditional))
}

/// All matching edges for a parallel fan-out: condition matches plus
/// unconditional edges.
pub fn select_fanout<'a>(
    node_id: &str,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a Graph,
) -> Vec<&'a Edge> {
    forward_edges(graph, node_id)
        .into_iter()
        .filter(|e| e.condition.is_none() || edge_condition_matches(e, resolve))
        .collect()
}

/// Where a final-failed node routes next, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailRoute {
    /// A forward edge whose condition matched the failure.
    Edge(String),
    /// A tagged retry back-edge or retry-target attribute; the target is
    /// re-run, counting against its own retry budget.
    Retry(String),
}

pub fn select_fail_route(
    node_id: &str,
    resolve: &dyn Fn(&str) -> String,
    graph: &Graph,
) -> Option<FailRoute> {
    // Conditional edges that match the failure (e.g. `outcome=fail`).
    let matching: Vec<&Edge> = forward_edges(graph, node_id)
        .into_iter()
        .filter(|e| e.condition.is_some() && edge_condition_matches(e, resolve))
        .collect();
    if !matching.is_empty() {
        return Some(FailRoute::Edge(
            best_by_weight_then_lexical(&matching).to.clone(),
        ));
    }

    // Tagged retry back-edges.
    let retries: Vec<&Edge> = graph
        .outgoing_edges(node_id)
        .iter()
        .filter(|e| e.kind == EdgeKind::Retry)
        .collect();
    if !retries.is_empty() {
        return Some(FailRoute::Retry(
            best_by_weight_then_lexical(&retries).to.clone(),
        ));
    }

    // Node attribute, then the graph-level fallback.
    if let Some(node) = graph.node(node_id) {
        if let Some(ref target) = node.retry_target {
            return Some(FailRoute::Retry(target.clone()));
        }
    }
    graph.retry_target().map(FailRoute::Retry)
}

fn forward_edges<'a>(graph: &'a Graph, node_id: &str) -> Vec<&'a Edge> {
    graph
        .outgoing_edges(node_id)
        .iter()
        .filter(|e| e.kind == EdgeKind::Forward)
        .collect()
}

fn edge_condition_matches(edge: &Edge, resolve: &dyn Fn(&str) -> String) -> bool {
    match edge.condition.as_deref() {
        None => false,
        Some(cond) => match parse_condition(cond) {
            Ok(expr) => evaluate(&expr, resolve),
            Err(_) => false,
        },
    }
}

/// Normalize a label for comparison: lowercase, strip accelerator prefixes
/// like `[Y]`, `Y)`, `Y-`.
fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w-\s*)")
        .unwrap()
        .replace(&s, "")
        .to_string()
}

/// Pick the edge with the highest weight; break ties by lexicographically
/// smallest `to` field.
fn best_by_weight_then_lexical<'a>(edges: &[&'a Edge]) -> &'a Edge {
    edges
        .iter()
        .copied()
        .max_by(|a, b| a.weight.cmp(&b.weight).then(b.to.cmp(&a.to)))
        .unwrap()
}
