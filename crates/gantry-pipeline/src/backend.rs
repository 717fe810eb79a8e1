//! The `Backend` capability: how codergen stages reach an agent loop.
//!
//! The engine never talks to a model provider directly. A stage node hands
//! its prompt to whatever implements [`Backend`] and gets back a
//! [`BackendResult`]. The built-in [`SimulationBackend`] answers without
//! doing any work, which is what dry runs and tests use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use gantry_types::Result;

use crate::graph::Node;
use crate::run::RunContext;

/// What came back from one agent invocation.
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub summary: String,
    pub artifact_paths: Vec<String>,
    pub data: HashMap<String, serde_json::Value>,
    /// Whether the agent explicitly confirmed the node's goal. Stages with
    /// `goal_gate=true` treat a `false` here as failure.
    pub goal_achieved: bool,
}

impl BackendResult {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            artifact_paths: Vec::new(),
            data: HashMap::new(),
            goal_achieved: true,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Run the agent for one stage node. Implementations should observe
    /// `run.cancel_token()` and return promptly when it fires.
    async fn run(&self, run: &RunContext, node: &Node, prompt: &str) -> Result<BackendResult>;
}

// ---------------------------------------------------------------------------
// SimulationBackend
// ---------------------------------------------------------------------------

/// A backend that fabricates a successful result without external calls.
pub struct SimulationBackend;

#[async_trait]
impl Backend for SimulationBackend {
    async fn run(&self, _run: &RunContext, node: &Node, prompt: &str) -> Result<BackendResult> {
        tracing::debug!(node = %node.id, "Simulating backend call");
        let mut result = BackendResult::success(format!("simulated: {}", node.label));
        result
            .data
            .insert("prompt".into(), serde_json::json!(prompt));
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// A backend that replays a queue of pre-recorded results. Used by tests
/// to script failure-then-success sequences.
pub struct ScriptedBackend {
    script: std::sync::Mutex<Vec<Result<BackendResult>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(mut script: Vec<Result<BackendResult>>) -> Arc<Self> {
        script.reverse();
        Arc::new(Self {
            script: std::sync::Mutex::new(script),
            calls: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn run(&self, _run: &RunContext, node: &Node, _prompt: &str) -> Result<BackendResult> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(BackendResult::success(format!("scripted: {}", node.id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_types::GantryError;

    fn make_node(id: &str) -> Node {
        let ast = gantry_dot::parse(&format!("digraph G {{ {id} [prompt=\"p\"] }}")).unwrap();
        crate::graph::Graph::from_dot(&ast)
            .unwrap()
            .node(id)
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn simulation_backend_echoes_prompt() {
        let backend = SimulationBackend;
        let run = RunContext::new("x");
        let node = make_node("stage");
        let result = backend.run(&run, &node, "build it").await.unwrap();
        assert!(result.goal_achieved);
        assert_eq!(result.data.get("prompt"), Some(&serde_json::json!("build it")));
    }

    #[tokio::test]
    async fn scripted_backend_replays_in_order() {
        let backend = ScriptedBackend::new(vec![
            Err(GantryError::BackendError {
                node: "stage".into(),
                message: "transient".into(),
                retryable: true,
            }),
            Ok(BackendResult::success("second time lucky")),
        ]);
        let run = RunContext::new("x");
        let node = make_node("stage");

        assert!(backend.run(&run, &node, "p").await.is_err());
        let second = backend.run(&run, &node, "p").await.unwrap();
        assert_eq!(second.summary, "second time lucky");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn scripted_backend_defaults_to_success_when_exhausted() {
        let backend = ScriptedBackend::new(vec![]);
        let run = RunContext::new("x");
        let node = make_node("stage");
        let result = backend.run(&run, &node, "p").await.unwrap();
        assert!(result.summary.contains("scripted"));
    }
}
