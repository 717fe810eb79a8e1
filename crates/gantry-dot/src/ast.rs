use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DotGraph {
    pub name: String,
    pub directed: bool,
    pub strict: bool,
    pub attrs: IndexMap<String, AttrValue>,
    /// Nodes in declaration order. Edge endpoints without an explicit node
    /// statement are appended when first referenced.
    pub nodes: IndexMap<String, NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub subgraphs: Vec<SubgraphDef>,
    pub node_defaults: IndexMap<String, AttrValue>,
    pub edge_defaults: IndexMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub attrs: IndexMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub attrs: IndexMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphDef {
    pub name: Option<String>,
    pub attrs: IndexMap<String, AttrValue>,
    pub nodes: IndexMap<String, NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub node_defaults: IndexMap<String, AttrValue>,
    pub edge_defaults: IndexMap<String, AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    #[serde(with = "crate::duration_serde")]
    Duration(Duration),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Str(s) => Some(s == "true"),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            AttrValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            AttrValue::Duration(d) => Some(*d),
            AttrValue::Int(ms) if *ms >= 0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        }
    }

    /// Render the value the way a human would write it in DOT source.
    pub fn to_display_string(&self) -> String {
        match self {
            AttrValue::Str(s) => s.clone(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => format_float(*f),
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Duration(d) => format_duration(*d),
        }
    }
}

/// Format a float so it always re-parses as a float (never as an integer).
pub(crate) fn format_float(f: f64) -> String {
    let s = f.to_string();
    if s.contains('.') || s.contains('e') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Format a duration in the most compact unit that divides it evenly.
pub(crate) fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return "0ms".to_string();
    }
    if ms % 86_400_000 == 0 {
        format!("{}d", ms / 86_400_000)
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}
