//! Node handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use gantry_types::{Outcome, Result};

use crate::backend::Backend;
use crate::graph::{Graph, Node};
use crate::run::RunContext;

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "codergen").
    fn handler_type(&self) -> &str;

    /// Whether nodes of this type may carry `goal_gate=true`.
    fn supports_goal_gate(&self) -> bool {
        false
    }

    /// Whether a failed outcome from this handler may be retried under the
    /// active policy. Handlers mark permanent failures by setting the
    /// outcome's `retryable` data field to `false`.
    fn is_retriable(&self, outcome: &Outcome) -> bool {
        outcome
            .data
            .get("retryable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    /// Execute this handler for a given node.
    async fn execute(&self, run: &RunContext, node: &Node, graph: &Graph) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub fn supports_goal_gate(&self) -> bool {
        self.0.supports_goal_gate()
    }

    pub fn is_retriable(&self, outcome: &Outcome) -> bool {
        self.0.is_retriable(outcome)
    }

    pub async fn execute(&self, run: &RunContext, node: &Node, graph: &Graph) -> Result<Outcome> {
        self.0.execute(run, node, graph).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
    shape_to_type: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert("Mdiamond".into(), "start".into());
        shape_to_type.insert("Msquare".into(), "exit".into());
        shape_to_type.insert("diamond".into(), "decision".into());
        shape_to_type.insert("box".into(), "codergen".into());
        shape_to_type.insert("hexagon".into(), "wait.human".into());
        shape_to_type.insert("parallelogram".into(), "parallel".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
        }
    }

    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type: explicit `type` attribute first,
    /// then the shape mapping, then the `codergen` default for plain stages.
    pub fn resolve_type(&self, node: &Node) -> String {
        if let Some(ref t) = node.node_type {
            return t.clone();
        }
        if let Some(t) = self.shape_to_type.get(&node.shape) {
            return t.clone();
        }
        "codergen".to_string()
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    /// Registered handler type names, for validation of `type` attributes.
    pub fn known_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sentinel and control-flow handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(&self, _run: &RunContext, _node: &Node, _graph: &Graph) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(&self, _run: &RunContext, _node: &Node, _graph: &Graph) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline completed"))
    }
}

/// Pure control-flow node: edge conditions do the routing, the handler
/// itself always succeeds.
pub struct DecisionHandler;

#[async_trait]
impl NodeHandler for DecisionHandler {
    fn handler_type(&self) -> &str {
        "decision"
    }

    async fn execute(&self, _run: &RunContext, _node: &Node, _graph: &Graph) -> Result<Outcome> {
        Ok(Outcome::success("Decision pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry factories
// ---------------------------------------------------------------------------

/// Registry with all built-in handlers except `wait.human`.
///
/// The structural types (`parallel`, `subpipeline`) register marker
/// handlers here; their fan-out and child-run mechanics live in the engine,
/// which intercepts them before plain dispatch.
pub fn default_registry(backend: Arc<dyn Backend>) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(DecisionHandler);
    reg.register(crate::handlers::CodergenHandler::new(backend));
    reg.register(crate::handlers::ParallelHandler);
    reg.register(crate::handlers::SubpipelineHandler);
    reg
}

/// Default registry plus a `wait.human` handler bound to the given
/// interviewer. Needed for pipelines with hexagon nodes.
pub fn default_registry_with_interviewer(
    backend: Arc<dyn Backend>,
    interviewer: Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry(backend);
    reg.register(crate::handlers::WaitHumanHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
