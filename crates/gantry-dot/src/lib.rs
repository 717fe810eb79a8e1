//! DOT parser and serializer for the Graphviz subset used by Gantry pipelines.
//!
//! Parses `digraph Name { ... }` (and undirected `graph` declarations) with
//! nodes, edges, subgraphs, and typed attributes, producing a typed AST:
//! [`DotGraph`], [`NodeDef`], [`EdgeDef`], [`SubgraphDef`], [`AttrValue`].
//! The inverse direction is [`to_dot`], which emits canonical DOT source that
//! re-parses to a structurally identical graph.
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> process -> done }"#;
//! let graph = gantry_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! let round = gantry_dot::parse(&gantry_dot::to_dot(&graph)).unwrap();
//! assert_eq!(graph, round);
//! ```

pub mod ast;
mod duration_serde;
mod parser;
mod serialize;

pub use ast::*;
pub use parser::parse;
pub use serialize::to_dot;
