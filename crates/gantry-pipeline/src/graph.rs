use std::time::Duration;

use indexmap::IndexMap;

use gantry_dot::{AttrValue, DotGraph, EdgeDef, NodeDef};

/// Runtime pipeline graph built from a parsed [`DotGraph`].
///
/// Nodes keep their declaration order. Edges are sorted by `from` so each
/// node's outgoing edges form a contiguous slice addressed by `adjacency`.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub goal: String,
    pub attrs: IndexMap<String, AttrValue>,
    nodes: IndexMap<String, Node>,
    edges: Vec<Edge>,
    adjacency: IndexMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub condition: Option<String>,
    pub goal_gate: bool,
    /// Per-node retry cap; the engine falls back to the active policy's
    /// attempt budget when absent.
    pub max_retries: Option<usize>,
    pub timeout: Option<Duration>,
    pub retry_target: Option<String>,
    pub graph_ref: Option<String>,
    pub graph_dot: Option<String>,
    pub context_forward: Vec<String>,
    pub context_capture: Vec<String>,
    pub raw_attrs: IndexMap<String, AttrValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Normal control-flow edge.
    Forward,
    /// Back-edge taken only when the source node final-fails. Tagged so
    /// traversal does not mistake the cycle for an error.
    Retry,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i64,
    pub kind: EdgeKind,
    pub loop_restart: bool,
}

fn get_string(attrs: &IndexMap<String, AttrValue>, key: &str) -> Option<String> {
    attrs.get(key).and_then(|v| v.as_str().map(String::from))
}

fn get_bool(attrs: &IndexMap<String, AttrValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(AttrValue::as_bool)
}

fn get_int(attrs: &IndexMap<String, AttrValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(AttrValue::as_int)
}

fn get_duration(attrs: &IndexMap<String, AttrValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(AttrValue::as_duration)
}

fn split_key_list(attrs: &IndexMap<String, AttrValue>, key: &str) -> Vec<String> {
    get_string(attrs, key)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn node_from_def(
    id: &str,
    def: &NodeDef,
    graph_defaults: &IndexMap<String, AttrValue>,
    subgraph_defaults: Option<&IndexMap<String, AttrValue>>,
) -> Node {
    // Layer defaults: graph-level, then subgraph-level, then explicit attrs.
    let mut attrs = graph_defaults.clone();
    if let Some(sg) = subgraph_defaults {
        attrs.extend(sg.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    attrs.extend(def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    Node {
        id: id.to_string(),
        label: get_string(&attrs, "label").unwrap_or_else(|| id.to_string()),
        shape: get_string(&attrs, "shape").unwrap_or_else(|| "box".to_string()),
        node_type: get_string(&attrs, "type"),
        prompt: get_string(&attrs, "prompt"),
        condition: get_string(&attrs, "condition"),
        goal_gate: get_bool(&attrs, "goal_gate").unwrap_or(false),
        max_retries: get_int(&attrs, "max_retries").map(|v| v.max(0) as usize),
        timeout: get_duration(&attrs, "timeout")
            .or_else(|| get_int(&attrs, "timeout_ms").map(|ms| Duration::from_millis(ms.max(0) as u64))),
        retry_target: get_string(&attrs, "retry_target"),
        graph_ref: get_string(&attrs, "graph_ref"),
        graph_dot: get_string(&attrs, "graph_dot"),
        context_forward: split_key_list(&attrs, "context_forward"),
        context_capture: split_key_list(&attrs, "context_capture"),
        raw_attrs: attrs,
    }
}

fn edge_from_def(def: &EdgeDef, edge_defaults: &IndexMap<String, AttrValue>) -> Edge {
    let mut attrs = edge_defaults.clone();
    attrs.extend(def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    Edge {
        from: def.from.clone(),
        to: def.to.clone(),
        label: get_string(&attrs, "label"),
        condition: get_string(&attrs, "condition"),
        weight: get_int(&attrs, "weight").unwrap_or(0),
        kind: if get_bool(&attrs, "retry").unwrap_or(false) {
            EdgeKind::Retry
        } else {
            EdgeKind::Forward
        },
        loop_restart: get_bool(&attrs, "loop_restart").unwrap_or(false),
    }
}

impl Graph {
    pub fn from_dot(graph: &DotGraph) -> gantry_types::Result<Self> {
        let mut nodes = IndexMap::new();
        let mut all_edges = Vec::new();

        for (id, def) in &graph.nodes {
            nodes.insert(id.clone(), node_from_def(id, def, &graph.node_defaults, None));
        }

        for sg in &graph.subgraphs {
            for (id, def) in &sg.nodes {
                nodes.insert(
                    id.clone(),
                    node_from_def(id, def, &graph.node_defaults, Some(&sg.node_defaults)),
                );
            }
        }

        for def in &graph.edges {
            all_edges.push(edge_from_def(def, &graph.edge_defaults));
        }
        for sg in &graph.subgraphs {
            let mut sg_defaults = graph.edge_defaults.clone();
            sg_defaults.extend(sg.edge_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
            for def in &sg.edges {
                all_edges.push(edge_from_def(def, &sg_defaults));
            }
        }

        // Sort edges by `from` (stable) so outgoing edges are contiguous.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: IndexMap<String, (usize, usize)> = IndexMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = all_edges[i].from.clone();
            while i < all_edges.len() && all_edges[i].from == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        Ok(Graph {
            name: graph.name.clone(),
            goal: get_string(&graph.attrs, "goal").unwrap_or_default(),
            attrs: graph.attrs.clone(),
            nodes,
            edges: all_edges,
            adjacency,
        })
    }

    /// Find the start sentinel: shape == "Mdiamond" or id "start".
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.shape == "Mdiamond")
            .or_else(|| self.nodes.get("start"))
    }

    /// Find the first exit sentinel: shape == "Msquare".
    pub fn exit_node(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.shape == "Msquare")
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[Edge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == node_id)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn all_edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Graph-level retry target, consulted when a failed node has no
    /// fail-route of its own.
    pub fn retry_target(&self) -> Option<String> {
        get_string(&self.attrs, "retry_target")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_build(dot: &str) -> Graph {
        let ast = gantry_dot::parse(dot).unwrap();
        Graph::from_dot(&ast).unwrap()
    }

    #[test]
    fn from_dot_simple_linear_pipeline() {
        let g = parse_and_build(
            r#"digraph Pipeline {
            start [shape="Mdiamond"]
            process [label="Process Data"]
            done [shape="Msquare"]
            start -> process -> done
        }"#,
        );

        assert_eq!(g.name, "Pipeline");
        assert_eq!(g.all_edges().len(), 2);
        assert_eq!(g.node("process").unwrap().label, "Process Data");
        assert_eq!(g.start_node().unwrap().id, "start");
        assert_eq!(g.exit_node().unwrap().id, "done");
    }

    #[test]
    fn start_node_falls_back_to_id() {
        let g = parse_and_build(r#"digraph G { start -> work }"#);
        assert_eq!(g.start_node().unwrap().id, "start");
    }

    #[test]
    fn outgoing_edges_contiguous() {
        let g = parse_and_build(
            r#"digraph G {
            A -> B [label="first"]
            A -> C [label="second"]
            B -> C
        }"#,
        );

        assert_eq!(g.outgoing_edges("A").len(), 2);
        assert_eq!(g.outgoing_edges("B").len(), 1);
        assert_eq!(g.outgoing_edges("C").len(), 0);
    }

    #[test]
    fn typed_attribute_extraction() {
        let g = parse_and_build(
            r#"digraph G {
            step [max_retries=3, goal_gate=true, timeout=30s, condition="outcome=success"]
        }"#,
        );

        let node = g.node("step").unwrap();
        assert_eq!(node.max_retries, Some(3));
        assert!(node.goal_gate);
        assert_eq!(node.timeout, Some(Duration::from_secs(30)));
        assert_eq!(node.condition.as_deref(), Some("outcome=success"));
    }

    #[test]
    fn timeout_ms_attribute_accepted() {
        let g = parse_and_build(r#"digraph G { step [timeout_ms=1500] }"#);
        assert_eq!(
            g.node("step").unwrap().timeout,
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn context_lists_split_on_commas() {
        let g = parse_and_build(
            r#"digraph G {
            sub [type="subpipeline", graph_ref="child.dot", context_forward="goal, branch", context_capture="result"]
        }"#,
        );
        let node = g.node("sub").unwrap();
        assert_eq!(node.context_forward, vec!["goal", "branch"]);
        assert_eq!(node.context_capture, vec!["result"]);
        assert_eq!(node.graph_ref.as_deref(), Some("child.dot"));
    }

    #[test]
    fn retry_edge_tagged() {
        let g = parse_and_build(
            r#"digraph G {
            verify -> implement [retry=true]
            verify -> done
        }"#,
        );
        let edges = g.outgoing_edges("verify");
        let retry: Vec<_> = edges.iter().filter(|e| e.kind == EdgeKind::Retry).collect();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].to, "implement");
    }

    #[test]
    fn subgraph_nodes_included_with_defaults() {
        let g = parse_and_build(
            r#"digraph G {
            start -> A
            subgraph cluster_inner {
                node [shape="ellipse"]
                A -> B
            }
            B -> done
        }"#,
        );

        assert_eq!(g.node("A").unwrap().shape, "ellipse");
        assert!(g.node("B").is_some());
        assert_eq!(g.all_edges().len(), 3);
    }

    #[test]
    fn goal_extracted_from_graph_attrs() {
        let g = parse_and_build(
            r#"digraph G {
            goal = "Complete the pipeline"
            A -> B
        }"#,
        );
        assert_eq!(g.goal, "Complete the pipeline");
    }

    #[test]
    fn edge_weight_and_condition() {
        let g = parse_and_build(
            r#"digraph G {
            A -> B [weight=5, condition="outcome=success", loop_restart=true]
        }"#,
        );
        let edges = g.outgoing_edges("A");
        assert_eq!(edges[0].weight, 5);
        assert_eq!(edges[0].condition.as_deref(), Some("outcome=success"));
        assert!(edges[0].loop_restart);
    }

    #[test]
    fn default_shape_is_box() {
        let g = parse_and_build(r#"digraph G { plain [label="x"] }"#);
        assert_eq!(g.node("plain").unwrap().shape, "box");
    }
}
