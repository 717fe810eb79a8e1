//! Pipeline validation: lint rules and diagnostics.
//!
//! Structural and semantic checks over a [`Graph`]. [`validate`] returns
//! advisory diagnostics; [`validate_or_raise`] refuses graphs with any
//! `Error`-severity finding.

use std::collections::{HashSet, VecDeque};

use crate::condition::parse_condition;
use crate::graph::{EdgeKind, Graph};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helper predicates
// ---------------------------------------------------------------------------

/// Node `type` values with built-in handlers. Anything else is a hard error.
pub const KNOWN_TYPES: &[&str] = &[
    "start",
    "exit",
    "decision",
    "codergen",
    "wait.human",
    "parallel",
    "subpipeline",
];

/// Types whose handlers honor `goal_gate=true`.
const GOAL_GATE_TYPES: &[&str] = &["codergen", "parallel", "subpipeline"];

fn is_start_node(id: &str, shape: &str) -> bool {
    shape == "Mdiamond" || id == "start"
}

fn is_terminal_node(id: &str, shape: &str) -> bool {
    shape == "Msquare" || id == "exit" || id == "done"
}

fn effective_type(node: &crate::graph::Node) -> String {
    if let Some(ref t) = node.node_type {
        return t.clone();
    }
    match node.shape.as_str() {
        "Mdiamond" => "start",
        "Msquare" => "exit",
        "diamond" => "decision",
        "hexagon" => "wait.human",
        "parallelogram" => "parallel",
        _ => "codergen",
    }
    .to_string()
}

fn reachable_from_start(graph: &Graph) -> HashSet<String> {
    let mut visited = HashSet::new();
    let Some(start) = graph.start_node() else {
        return visited;
    };
    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());
    while let Some(current) = queue.pop_front() {
        for edge in graph.outgoing_edges(&current) {
            if visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    visited
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str {
        "start_node"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph
            .all_nodes()
            .filter(|n| is_start_node(&n.id, &n.shape))
            .collect();
        if starts.is_empty() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Pipeline has no start node (shape=Mdiamond or id start)".into(),
                node_id: None,
                edge: None,
                fix: Some("Add a node with shape=\"Mdiamond\"".into()),
            }]
        } else if starts.len() > 1 {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Pipeline has {} start nodes: {}; expected exactly one",
                    starts.len(),
                    starts
                        .iter()
                        .map(|n| n.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                node_id: None,
                edge: None,
                fix: Some("Remove extra start nodes so only one remains".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct TerminalNodeRule;
impl LintRule for TerminalNodeRule {
    fn name(&self) -> &str {
        "terminal_node"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let reachable = reachable_from_start(graph);
        let has_reachable_terminal = graph
            .all_nodes()
            .any(|n| is_terminal_node(&n.id, &n.shape) && reachable.contains(&n.id));
        let has_any_terminal = graph
            .all_nodes()
            .any(|n| is_terminal_node(&n.id, &n.shape));
        if !has_any_terminal {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Pipeline has no terminal node (shape=Msquare or id exit/done)".into(),
                node_id: None,
                edge: None,
                fix: Some("Add a node with shape=\"Msquare\"".into()),
            }]
        } else if !has_reachable_terminal && graph.start_node().is_some() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "No terminal node is reachable from the start node".into(),
                node_id: None,
                edge: None,
                fix: Some("Connect the pipeline to an exit node".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        if graph.start_node().is_none() {
            return vec![]; // StartNodeRule reports this.
        }
        let visited = reachable_from_start(graph);
        graph
            .all_nodes()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Node '{}' is not reachable from the start node", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Add an edge leading to '{}' or remove it", n.id)),
            })
            .collect()
    }
}

struct EdgeTargetExistsRule;
impl LintRule for EdgeTargetExistsRule {
    fn name(&self) -> &str {
        "edge_target_exists"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter(|e| graph.node(&e.to).is_none())
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Edge {} -> {} references non-existent target '{}'",
                    e.from, e.to, e.to
                ),
                node_id: None,
                edge: Some((e.from.clone(), e.to.clone())),
                fix: Some(format!("Add node '{}' or fix the edge target", e.to)),
            })
            .collect()
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![];
        };
        let has_incoming = graph
            .all_edges()
            .iter()
            .any(|e| e.to == start.id && e.kind == EdgeKind::Forward);
        if has_incoming {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Start node '{}' has incoming edges", start.id),
                node_id: Some(start.id.clone()),
                edge: None,
                fix: Some("Remove edges pointing to the start node".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct ExitNoOutgoingRule;
impl LintRule for ExitNoOutgoingRule {
    fn name(&self) -> &str {
        "exit_no_outgoing"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| is_terminal_node(&n.id, &n.shape))
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Terminal node '{}' has outgoing edges", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Remove outgoing edges from '{}'", n.id)),
            })
            .collect()
    }
}

struct DecisionEdgesRule;
impl LintRule for DecisionEdgesRule {
    fn name(&self) -> &str {
        "decision_edges"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_nodes().filter(|n| n.shape == "diamond") {
            let edges: Vec<_> = graph
                .outgoing_edges(&node.id)
                .iter()
                .filter(|e| e.kind == EdgeKind::Forward)
                .collect();
            if edges.len() < 2 {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "Decision node '{}' has {} outgoing edges; a gate needs at least 2",
                        node.id,
                        edges.len()
                    ),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    fix: Some("Add branches for each decision outcome".into()),
                });
                continue;
            }
            let mut seen: HashSet<&str> = HashSet::new();
            for edge in &edges {
                let cond = edge.condition.as_deref().unwrap_or("");
                if !seen.insert(cond) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Decision node '{}' has multiple edges with the same condition '{}'",
                            node.id, cond
                        ),
                        node_id: Some(node.id.clone()),
                        edge: Some((edge.from.clone(), edge.to.clone())),
                        fix: Some("Make branch conditions mutually distinct".into()),
                    });
                }
            }
        }
        diags
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for e in graph.all_edges() {
            if let Some(cond) = e.condition.as_deref() {
                if let Err(err) = parse_condition(cond) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Edge {} -> {} has invalid condition '{}': {}",
                            e.from, e.to, cond, err
                        ),
                        node_id: None,
                        edge: Some((e.from.clone(), e.to.clone())),
                        fix: Some("Fix the condition expression syntax".into()),
                    });
                }
            }
        }
        for n in graph.all_nodes() {
            if let Some(cond) = n.condition.as_deref() {
                if let Err(err) = parse_condition(cond) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Node '{}' has invalid condition '{}': {}",
                            n.id, cond, err
                        ),
                        node_id: Some(n.id.clone()),
                        edge: None,
                        fix: Some("Fix the condition expression syntax".into()),
                    });
                }
            }
        }
        diags
    }
}

struct KnownTypeRule;
impl LintRule for KnownTypeRule {
    fn name(&self) -> &str {
        "known_type"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| {
                let t = n.node_type.as_deref()?;
                if KNOWN_TYPES.contains(&t) {
                    None
                } else {
                    Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Node '{}' has unknown type '{}'", n.id, t),
                        node_id: Some(n.id.clone()),
                        edge: None,
                        fix: Some(format!("Use one of: {}", KNOWN_TYPES.join(", "))),
                    })
                }
            })
            .collect()
    }
}

struct GoalGateSupportRule;
impl LintRule for GoalGateSupportRule {
    fn name(&self) -> &str {
        "goal_gate_support"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.goal_gate)
            .filter(|n| !GOAL_GATE_TYPES.contains(&effective_type(n).as_str()))
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Node '{}' has goal_gate=true but its handler type '{}' does not support goal gates",
                    n.id,
                    effective_type(n)
                ),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("Remove goal_gate or change the node type".into()),
            })
            .collect()
    }
}

struct MaxRetriesRule;
impl LintRule for MaxRetriesRule {
    fn name(&self) -> &str {
        "max_retries"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| {
                let raw = n.raw_attrs.get("max_retries")?.as_int()?;
                if raw < 0 {
                    Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Node '{}' has negative max_retries {raw}", n.id),
                        node_id: Some(n.id.clone()),
                        edge: None,
                        fix: Some("Use max_retries >= 0".into()),
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

struct SubpipelineSourceRule;
impl LintRule for SubpipelineSourceRule {
    fn name(&self) -> &str {
        "subpipeline_source"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| effective_type(n) == "subpipeline")
            .filter(|n| n.graph_ref.is_none() && n.graph_dot.is_none())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Subpipeline node '{}' declares neither graph_ref nor graph_dot",
                    n.id
                ),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("Add graph_ref=\"path.dot\" or an inline graph_dot".into()),
            })
            .collect()
    }
}

struct GoalGateHasRetryRule;
impl LintRule for GoalGateHasRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }
    fn apply(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.goal_gate && n.retry_target.is_none() && graph.retry_target().is_none())
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Node '{}' has goal_gate=true but no retry_target", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("Add a retry_target so the goal gate can loop back".into()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &Graph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(StartNodeRule),
        Box::new(TerminalNodeRule),
        Box::new(ReachabilityRule),
        Box::new(EdgeTargetExistsRule),
        Box::new(StartNoIncomingRule),
        Box::new(ExitNoOutgoingRule),
        Box::new(DecisionEdgesRule),
        Box::new(ConditionSyntaxRule),
        Box::new(KnownTypeRule),
        Box::new(GoalGateSupportRule),
        Box::new(MaxRetriesRule),
        Box::new(SubpipelineSourceRule),
        Box::new(GoalGateHasRetryRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &Graph) -> gantry_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(gantry_types::GantryError::ValidationError(
            messages.join("; "),
        ));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
