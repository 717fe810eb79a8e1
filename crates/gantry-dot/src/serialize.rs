//! Canonical DOT serialization.
//!
//! Emits a parsed [`DotGraph`] back as DOT source such that re-parsing the
//! output yields a structurally identical graph: graph attributes first,
//! then defaults, node statements in declaration order, subgraph blocks,
//! and finally edge statements.

use std::fmt::Write;

use indexmap::IndexMap;

use crate::ast::{AttrValue, DotGraph, SubgraphDef};

/// Render an identifier, quoting it unless it is a bare DOT identifier.
fn ident(s: &str) -> String {
    let bare = !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if bare {
        s.to_string()
    } else {
        format!("\"{}\"", escape(s))
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn value(v: &AttrValue) -> String {
    match v {
        AttrValue::Str(s) => format!("\"{}\"", escape(s)),
        other => other.to_display_string(),
    }
}

fn attr_list(attrs: &IndexMap<String, AttrValue>) -> String {
    let parts: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}={}", value(v))).collect();
    parts.join(", ")
}

fn write_body(
    out: &mut String,
    indent: &str,
    attrs: &IndexMap<String, AttrValue>,
    node_defaults: &IndexMap<String, AttrValue>,
    edge_defaults: &IndexMap<String, AttrValue>,
    nodes: &IndexMap<String, crate::ast::NodeDef>,
    edges: &[crate::ast::EdgeDef],
    subgraphs: &[SubgraphDef],
    edge_op: &str,
) {
    for (k, v) in attrs {
        let _ = writeln!(out, "{indent}{k}={};", value(v));
    }
    if !node_defaults.is_empty() {
        let _ = writeln!(out, "{indent}node [{}];", attr_list(node_defaults));
    }
    if !edge_defaults.is_empty() {
        let _ = writeln!(out, "{indent}edge [{}];", attr_list(edge_defaults));
    }
    for node in nodes.values() {
        if node.attrs.is_empty() {
            let _ = writeln!(out, "{indent}{};", ident(&node.id));
        } else {
            let _ = writeln!(out, "{indent}{} [{}];", ident(&node.id), attr_list(&node.attrs));
        }
    }
    for sg in subgraphs {
        match &sg.name {
            Some(name) => {
                let _ = writeln!(out, "{indent}subgraph {name} {{");
            }
            None => {
                let _ = writeln!(out, "{indent}subgraph {{");
            }
        }
        let inner = format!("{indent}  ");
        write_body(
            out,
            &inner,
            &sg.attrs,
            &sg.node_defaults,
            &sg.edge_defaults,
            &sg.nodes,
            &sg.edges,
            &[],
            edge_op,
        );
        let _ = writeln!(out, "{indent}}}");
    }
    for edge in edges {
        if edge.attrs.is_empty() {
            let _ = writeln!(out, "{indent}{} {edge_op} {};", ident(&edge.from), ident(&edge.to));
        } else {
            let _ = writeln!(
                out,
                "{indent}{} {edge_op} {} [{}];",
                ident(&edge.from),
                ident(&edge.to),
                attr_list(&edge.attrs),
            );
        }
    }
}

/// Serialize a graph to canonical DOT source.
pub fn to_dot(graph: &DotGraph) -> String {
    let mut out = String::new();
    if graph.strict {
        out.push_str("strict ");
    }
    out.push_str(if graph.directed { "digraph" } else { "graph" });
    if !graph.name.is_empty() {
        out.push(' ');
        out.push_str(&ident(&graph.name));
    }
    out.push_str(" {\n");
    let edge_op = if graph.directed { "->" } else { "--" };
    write_body(
        &mut out,
        "  ",
        &graph.attrs,
        &graph.node_defaults,
        &graph.edge_defaults,
        &graph.nodes,
        &graph.edges,
        &graph.subgraphs,
        edge_op,
    );
    out.push_str("}\n");
    out
}
