//! Built-in node handlers beyond the sentinels.

pub mod codergen;
pub mod wait_human;

pub use codergen::CodergenHandler;
pub use wait_human::WaitHumanHandler;

use async_trait::async_trait;

use gantry_types::{Outcome, Result};

use crate::graph::{Graph, Node};
use crate::handler::NodeHandler;
use crate::run::RunContext;

/// Marker handler for "parallel" nodes (shape="parallelogram").
///
/// The engine intercepts parallel nodes before dispatch and runs the branch
/// targets itself; this handler only executes if a parallel node has no
/// outgoing edges at all.
pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    fn supports_goal_gate(&self) -> bool {
        true
    }

    async fn execute(&self, _run: &RunContext, node: &Node, graph: &Graph) -> Result<Outcome> {
        let branches = graph.outgoing_edges(&node.id).len();
        if branches == 0 {
            return Ok(Outcome::fail("parallel node has no outgoing edges")
                .with_data("retryable", serde_json::json!(false)));
        }
        Ok(Outcome::success(format!("Fan-out to {branches} branches")))
    }
}

/// Marker handler for "subpipeline" nodes.
///
/// The engine intercepts subpipeline nodes and runs the child graph under a
/// derived run context; this handler only reports a misconfigured node.
pub struct SubpipelineHandler;

#[async_trait]
impl NodeHandler for SubpipelineHandler {
    fn handler_type(&self) -> &str {
        "subpipeline"
    }

    fn supports_goal_gate(&self) -> bool {
        true
    }

    async fn execute(&self, _run: &RunContext, node: &Node, _graph: &Graph) -> Result<Outcome> {
        if node.graph_ref.is_none() && node.graph_dot.is_none() {
            return Ok(Outcome::fail(
                "subpipeline node declares neither graph_ref nor graph_dot",
            )
            .with_data("retryable", serde_json::json!(false)));
        }
        Ok(Outcome::success("Subpipeline dispatch"))
    }
}
