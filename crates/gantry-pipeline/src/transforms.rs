//! Graph transforms applied between parse and validate.
//!
//! Each transform is a small pass over the parsed [`DotGraph`]. The default
//! registry runs them in a fixed order: attribute-casing normalization,
//! implicit sentinel insertion, review-shorthand expansion, default-retry
//! annotation, retry-target edge resolution, and prompt variable expansion.

use std::collections::HashMap;

use indexmap::IndexMap;

use gantry_dot::{AttrValue, DotGraph, EdgeDef, NodeDef};

pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()>;
}

pub struct TransformRegistry {
    transforms: Vec<Box<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.push(NormalizeAttrCasing);
        reg.push(InsertSentinels);
        reg.push(ExpandReviewShorthand);
        reg.push(AnnotateDefaultRetries);
        reg.push(ResolveRetryTargets);
        reg.push(ExpandPromptVariables);
        reg
    }

    pub fn push(&mut self, transform: impl Transform + 'static) {
        self.transforms.push(Box::new(transform));
    }

    pub fn apply_all(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        for t in &self.transforms {
            tracing::debug!(transform = t.name(), "Applying transform");
            t.apply(graph)?;
        }
        Ok(())
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by passes
// ---------------------------------------------------------------------------

fn node_shape(def: &NodeDef) -> &str {
    def.attrs
        .get("shape")
        .and_then(AttrValue::as_str)
        .unwrap_or("box")
}

/// Apply `f` to every node definition, top-level and inside subgraphs.
fn for_each_node(graph: &mut DotGraph, mut f: impl FnMut(&mut NodeDef)) {
    for def in graph.nodes.values_mut() {
        f(def);
    }
    for sg in &mut graph.subgraphs {
        for def in sg.nodes.values_mut() {
            f(def);
        }
    }
}

fn all_edges(graph: &DotGraph) -> Vec<&EdgeDef> {
    graph
        .edges
        .iter()
        .chain(graph.subgraphs.iter().flat_map(|sg| sg.edges.iter()))
        .collect()
}

fn all_node_ids(graph: &DotGraph) -> Vec<String> {
    let mut ids: Vec<String> = graph.nodes.keys().cloned().collect();
    for sg in &graph.subgraphs {
        for id in sg.nodes.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }
    ids
}

// ---------------------------------------------------------------------------
// NormalizeAttrCasing
// ---------------------------------------------------------------------------

/// Lowercase the casing of well-known attribute keys (`Prompt` → `prompt`)
/// so later passes and typed accessors see a single spelling.
pub struct NormalizeAttrCasing;

const KNOWN_KEYS: &[&str] = &[
    "shape",
    "type",
    "prompt",
    "goal_gate",
    "max_retries",
    "timeout",
    "timeout_ms",
    "condition",
    "label",
    "weight",
    "retry",
    "retry_target",
    "default_max_retry",
    "rankdir",
    "goal",
    "review",
    "loop_restart",
    "graph_ref",
    "graph_dot",
    "context_forward",
    "context_capture",
];

fn normalize_map(attrs: &mut IndexMap<String, AttrValue>) {
    let renames: Vec<(String, String)> = attrs
        .keys()
        .filter_map(|k| {
            let lower = k.to_lowercase();
            if lower != *k && KNOWN_KEYS.contains(&lower.as_str()) {
                Some((k.clone(), lower))
            } else {
                None
            }
        })
        .collect();
    for (old, new) in renames {
        if let Some(value) = attrs.shift_remove(&old) {
            attrs.entry(new).or_insert(value);
        }
    }
}

impl Transform for NormalizeAttrCasing {
    fn name(&self) -> &str {
        "normalize_attr_casing"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        normalize_map(&mut graph.attrs);
        normalize_map(&mut graph.node_defaults);
        normalize_map(&mut graph.edge_defaults);
        for_each_node(graph, |def| normalize_map(&mut def.attrs));
        for edge in &mut graph.edges {
            normalize_map(&mut edge.attrs);
        }
        for sg in &mut graph.subgraphs {
            normalize_map(&mut sg.attrs);
            normalize_map(&mut sg.node_defaults);
            normalize_map(&mut sg.edge_defaults);
            for edge in &mut sg.edges {
                normalize_map(&mut edge.attrs);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InsertSentinels
// ---------------------------------------------------------------------------

/// Add implicit `start` / `done` sentinel nodes when the graph has none,
/// wiring the start to every node without incoming edges and every node
/// without outgoing edges to the exit.
pub struct InsertSentinels;

impl Transform for InsertSentinels {
    fn name(&self) -> &str {
        "insert_sentinels"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        let ids = all_node_ids(graph);
        if ids.is_empty() {
            return Ok(());
        }

        let has_start = graph.nodes.values().any(|n| node_shape(n) == "Mdiamond")
            || graph
                .subgraphs
                .iter()
                .any(|sg| sg.nodes.values().any(|n| node_shape(n) == "Mdiamond"))
            || ids.iter().any(|id| id == "start");
        let has_exit = graph.nodes.values().any(|n| node_shape(n) == "Msquare")
            || graph
                .subgraphs
                .iter()
                .any(|sg| sg.nodes.values().any(|n| node_shape(n) == "Msquare"))
            || ids.iter().any(|id| id == "done" || id == "exit");

        if !has_start {
            let with_incoming: Vec<String> =
                all_edges(graph).iter().map(|e| e.to.clone()).collect();
            let mut roots: Vec<String> = ids
                .iter()
                .filter(|id| !with_incoming.contains(id))
                .cloned()
                .collect();
            if roots.is_empty() {
                roots.push(ids[0].clone());
            }

            let mut attrs = IndexMap::new();
            attrs.insert("shape".to_string(), AttrValue::Str("Mdiamond".into()));
            graph.nodes.insert(
                "start".to_string(),
                NodeDef {
                    id: "start".to_string(),
                    attrs,
                },
            );
            for root in roots {
                graph.edges.push(EdgeDef {
                    from: "start".to_string(),
                    to: root,
                    attrs: IndexMap::new(),
                });
            }
        }

        if !has_exit {
            let with_outgoing: Vec<String> =
                all_edges(graph).iter().map(|e| e.from.clone()).collect();
            let mut leaves: Vec<String> = ids
                .iter()
                .filter(|id| !with_outgoing.contains(id))
                .cloned()
                .collect();
            if leaves.is_empty() {
                leaves.push(ids[ids.len() - 1].clone());
            }

            let mut attrs = IndexMap::new();
            attrs.insert("shape".to_string(), AttrValue::Str("Msquare".into()));
            graph.nodes.insert(
                "done".to_string(),
                NodeDef {
                    id: "done".to_string(),
                    attrs,
                },
            );
            for leaf in leaves {
                graph.edges.push(EdgeDef {
                    from: leaf,
                    to: "done".to_string(),
                    attrs: IndexMap::new(),
                });
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExpandReviewShorthand
// ---------------------------------------------------------------------------

/// Expand the `review=llm` / `review=human` shorthand into fully-typed
/// stage and human-gate nodes.
pub struct ExpandReviewShorthand;

impl Transform for ExpandReviewShorthand {
    fn name(&self) -> &str {
        "expand_review_shorthand"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        for_each_node(graph, |def| {
            let review = def
                .attrs
                .get("review")
                .and_then(AttrValue::as_str)
                .map(String::from);
            match review.as_deref() {
                Some("llm") => {
                    def.attrs
                        .insert("type".to_string(), AttrValue::Str("codergen".into()));
                    def.attrs.shift_remove("review");
                }
                Some("human") => {
                    def.attrs
                        .insert("type".to_string(), AttrValue::Str("wait.human".into()));
                    def.attrs
                        .insert("shape".to_string(), AttrValue::Str("hexagon".into()));
                    def.attrs.shift_remove("review");
                }
                _ => {}
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AnnotateDefaultRetries
// ---------------------------------------------------------------------------

/// Copy the graph-level `default_max_retry` onto stage nodes that do not
/// declare their own `max_retries`.
pub struct AnnotateDefaultRetries;

impl Transform for AnnotateDefaultRetries {
    fn name(&self) -> &str {
        "annotate_default_retries"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        let Some(default) = graph
            .attrs
            .get("default_max_retry")
            .and_then(AttrValue::as_int)
        else {
            return Ok(());
        };
        for_each_node(graph, |def| {
            if node_shape(def) == "box" && !def.attrs.contains_key("max_retries") {
                def.attrs
                    .insert("max_retries".to_string(), AttrValue::Int(default));
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ResolveRetryTargets
// ---------------------------------------------------------------------------

/// Turn node-level `retry_target` attributes into tagged retry back-edges
/// so failure routing and cycle checks can treat them uniformly.
pub struct ResolveRetryTargets;

impl Transform for ResolveRetryTargets {
    fn name(&self) -> &str {
        "resolve_retry_targets"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        let mut new_edges = Vec::new();
        let existing: Vec<(String, String, bool)> = all_edges(graph)
            .iter()
            .map(|e| {
                (
                    e.from.clone(),
                    e.to.clone(),
                    e.attrs.get("retry").and_then(AttrValue::as_bool).unwrap_or(false),
                )
            })
            .collect();

        let mut collect = |def: &NodeDef| {
            if let Some(target) = def.attrs.get("retry_target").and_then(AttrValue::as_str) {
                let already = existing
                    .iter()
                    .any(|(from, to, retry)| *retry && from == &def.id && to == target);
                if !already {
                    new_edges.push((def.id.clone(), target.to_string()));
                }
            }
        };
        for def in graph.nodes.values() {
            collect(def);
        }
        for sg in &graph.subgraphs {
            for def in sg.nodes.values() {
                collect(def);
            }
        }

        for (from, to) in new_edges {
            let mut attrs = IndexMap::new();
            attrs.insert("retry".to_string(), AttrValue::Bool(true));
            graph.edges.push(EdgeDef { from, to, attrs });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExpandPromptVariables
// ---------------------------------------------------------------------------

/// Expand `${variable}` references in node prompts from graph attributes.
pub struct ExpandPromptVariables;

/// Expand `${key}` patterns in a string. Unknown variables are left as-is.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let pattern = format!("${{{key}}}");
        result = result.replace(&pattern, value);
    }
    result
}

impl Transform for ExpandPromptVariables {
    fn name(&self) -> &str {
        "expand_prompt_variables"
    }

    fn apply(&self, graph: &mut DotGraph) -> gantry_types::Result<()> {
        let vars: HashMap<String, String> = graph
            .attrs
            .iter()
            .filter_map(|(k, v)| match v {
                AttrValue::Duration(_) => None,
                other => Some((k.clone(), other.to_display_string())),
            })
            .collect();

        for_each_node(graph, |def| {
            if let Some(AttrValue::Str(prompt)) = def.attrs.get("prompt") {
                let expanded = expand_variables(prompt, &vars);
                if expanded != *prompt {
                    def.attrs
                        .insert("prompt".to_string(), AttrValue::Str(expanded));
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformed(dot: &str) -> DotGraph {
        let mut graph = gantry_dot::parse(dot).unwrap();
        TransformRegistry::with_defaults()
            .apply_all(&mut graph)
            .unwrap();
        graph
    }

    // ---- expand_variables unit tests ----

    #[test]
    fn expand_single_variable() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "world".to_string());
        assert_eq!(expand_variables("Hello ${name}!", &vars), "Hello world!");
    }

    #[test]
    fn expand_unknown_variable_left_as_is() {
        let vars = HashMap::new();
        let template = "Still has ${unknown} in it.";
        assert_eq!(expand_variables(template, &vars), template);
    }

    #[test]
    fn expand_same_variable_multiple_times() {
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), "42".to_string());
        assert_eq!(expand_variables("${x} + ${x}", &vars), "42 + 42");
    }

    // ---- pass tests ----

    #[test]
    fn sentinels_inserted_when_absent() {
        let graph = transformed("digraph G { a -> b }");
        assert!(graph.nodes.contains_key("start"));
        assert!(graph.nodes.contains_key("done"));
        assert!(graph
            .edges
            .iter()
            .any(|e| e.from == "start" && e.to == "a"));
        assert!(graph.edges.iter().any(|e| e.from == "b" && e.to == "done"));
    }

    #[test]
    fn sentinels_not_duplicated() {
        let graph = transformed(
            r#"digraph G {
                begin [shape="Mdiamond"]
                finish [shape="Msquare"]
                begin -> work -> finish
            }"#,
        );
        assert!(!graph.nodes.contains_key("start"));
        assert!(!graph.nodes.contains_key("done"));
    }

    #[test]
    fn attr_casing_normalized_for_known_keys() {
        let graph = transformed(
            r#"digraph G {
                a [Shape="Mdiamond", Prompt="go"]
                b [shape="Msquare"]
                a -> b
            }"#,
        );
        let a = graph.nodes.get("a").unwrap();
        assert!(a.attrs.contains_key("shape"));
        assert!(a.attrs.contains_key("prompt"));
        assert!(!a.attrs.contains_key("Shape"));
    }

    #[test]
    fn review_shorthand_expands_to_human_gate() {
        let graph = transformed(
            r#"digraph G {
                start [shape="Mdiamond"]
                check [review="human", prompt="Approve?"]
                done [shape="Msquare"]
                start -> check -> done
            }"#,
        );
        let check = graph.nodes.get("check").unwrap();
        assert_eq!(
            check.attrs.get("type"),
            Some(&AttrValue::Str("wait.human".into()))
        );
        assert_eq!(
            check.attrs.get("shape"),
            Some(&AttrValue::Str("hexagon".into()))
        );
        assert!(!check.attrs.contains_key("review"));
    }

    #[test]
    fn review_shorthand_expands_to_codergen() {
        let graph = transformed(
            r#"digraph G {
                start [shape="Mdiamond"]
                check [review="llm", prompt="Review the diff"]
                done [shape="Msquare"]
                start -> check -> done
            }"#,
        );
        assert_eq!(
            graph.nodes.get("check").unwrap().attrs.get("type"),
            Some(&AttrValue::Str("codergen".into()))
        );
    }

    #[test]
    fn default_retries_annotated_on_stages() {
        let graph = transformed(
            r#"digraph G {
                default_max_retry = 2
                start [shape="Mdiamond"]
                work [prompt="do"]
                pinned [prompt="do", max_retries=5]
                done [shape="Msquare"]
                start -> work -> pinned -> done
            }"#,
        );
        assert_eq!(
            graph.nodes.get("work").unwrap().attrs.get("max_retries"),
            Some(&AttrValue::Int(2))
        );
        assert_eq!(
            graph.nodes.get("pinned").unwrap().attrs.get("max_retries"),
            Some(&AttrValue::Int(5))
        );
        // Sentinels are not stages; no retries annotated.
        assert!(!graph
            .nodes
            .get("start")
            .unwrap()
            .attrs
            .contains_key("max_retries"));
    }

    #[test]
    fn retry_target_becomes_tagged_back_edge() {
        let graph = transformed(
            r#"digraph G {
                start [shape="Mdiamond"]
                verify [prompt="verify", retry_target="implement"]
                implement [prompt="implement"]
                done [shape="Msquare"]
                start -> implement -> verify -> done
            }"#,
        );
        let back: Vec<_> = graph
            .edges
            .iter()
            .filter(|e| e.from == "verify" && e.to == "implement")
            .collect();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].attrs.get("retry"), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn prompt_variables_expanded_from_graph_attrs() {
        let graph = transformed(
            r#"digraph G {
                language = "Rust"
                start [shape="Mdiamond"]
                work [prompt="Write a ${language} module"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        assert_eq!(
            graph.nodes.get("work").unwrap().attrs.get("prompt"),
            Some(&AttrValue::Str("Write a Rust module".into()))
        );
    }

    #[test]
    fn empty_graph_passes_through() {
        let mut graph = gantry_dot::parse("digraph G { }").unwrap();
        TransformRegistry::with_defaults()
            .apply_all(&mut graph)
            .unwrap();
        assert!(graph.nodes.is_empty());
    }
}
