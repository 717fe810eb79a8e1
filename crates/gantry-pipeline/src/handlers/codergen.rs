//! CodergenHandler — runs a stage prompt through the configured backend.

use std::sync::Arc;

use async_trait::async_trait;

use gantry_types::{Outcome, Result, StageStatus};

use crate::backend::Backend;
use crate::graph::{Graph, Node};
use crate::handler::NodeHandler;
use crate::run::RunContext;

pub struct CodergenHandler {
    backend: Arc<dyn Backend>,
}

impl CodergenHandler {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    fn supports_goal_gate(&self) -> bool {
        true
    }

    async fn execute(&self, run: &RunContext, node: &Node, _graph: &Graph) -> Result<Outcome> {
        let prompt = node.prompt.clone().unwrap_or_else(|| node.label.clone());

        let result = match self.backend.run(run, node, &prompt).await {
            Ok(result) => result,
            Err(e) if run.is_cancelled() => {
                tracing::debug!(node = %node.id, error = %e, "Backend returned during cancellation");
                return Ok(Outcome::with_status(StageStatus::Cancelled));
            }
            Err(e) => {
                let retryable = e.is_retryable();
                return Ok(Outcome::fail(e.to_string())
                    .with_data("retryable", serde_json::json!(retryable)));
            }
        };

        if node.goal_gate && !result.goal_achieved {
            let mut outcome = Outcome::fail(format!(
                "goal gate: backend did not confirm goal for '{}'",
                node.id
            ));
            outcome.data = result.data;
            outcome.artifact_paths = result.artifact_paths;
            return Ok(outcome);
        }

        // Expose the result to downstream nodes under the node's own key.
        run.context()
            .set(
                format!("{}.summary", node.id),
                serde_json::json!(result.summary.clone()),
            )
            .await;
        run.context()
            .set(format!("{}.prompt", node.id), serde_json::json!(prompt))
            .await;

        let mut outcome = Outcome::success(result.summary);
        outcome.artifact_paths = result.artifact_paths;
        outcome.data = result.data;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, ScriptedBackend, SimulationBackend};

    fn graph(dot: &str) -> Graph {
        Graph::from_dot(&gantry_dot::parse(dot).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn success_records_summary_in_context() {
        let g = graph(r#"digraph G { stage [prompt="Build the parser"] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let handler = CodergenHandler::new(Arc::new(SimulationBackend));

        let outcome = handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            run.context().get("stage.prompt").await,
            Some(serde_json::json!("Build the parser"))
        );
        assert!(run
            .context()
            .get("stage.summary")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn backend_error_becomes_fail_outcome() {
        let g = graph(r#"digraph G { stage [prompt="p"] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let backend = ScriptedBackend::new(vec![Err(gantry_types::GantryError::BackendError {
            node: "stage".into(),
            message: "503".into(),
            retryable: true,
        })]);
        let handler = CodergenHandler::new(backend);

        let outcome = handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(handler.is_retriable(&outcome));
    }

    #[tokio::test]
    async fn non_retryable_backend_error_marked() {
        let g = graph(r#"digraph G { stage [prompt="p"] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let backend = ScriptedBackend::new(vec![Err(gantry_types::GantryError::BackendError {
            node: "stage".into(),
            message: "bad request".into(),
            retryable: false,
        })]);
        let handler = CodergenHandler::new(backend);

        let outcome = handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(!handler.is_retriable(&outcome));
    }

    #[tokio::test]
    async fn goal_gate_unconfirmed_goal_fails() {
        let g = graph(r#"digraph G { stage [prompt="p", goal_gate=true] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let mut result = BackendResult::success("done, mostly");
        result.goal_achieved = false;
        let backend = ScriptedBackend::new(vec![Ok(result)]);
        let handler = CodergenHandler::new(backend);

        let outcome = handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.message.unwrap().contains("goal gate"));
    }

    #[tokio::test]
    async fn goal_gate_ignored_when_flag_absent() {
        let g = graph(r#"digraph G { stage [prompt="p"] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let mut result = BackendResult::success("fine");
        result.goal_achieved = false;
        let backend = ScriptedBackend::new(vec![Ok(result)]);
        let handler = CodergenHandler::new(backend);

        let outcome = handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
    }

    #[tokio::test]
    async fn prompt_falls_back_to_label() {
        let g = graph(r#"digraph G { stage [label="Write tests"] }"#);
        let node = g.node("stage").unwrap().clone();
        let run = RunContext::new("x");
        let handler = CodergenHandler::new(Arc::new(SimulationBackend));

        handler.execute(&run, &node, &g).await.unwrap();
        assert_eq!(
            run.context().get("stage.prompt").await,
            Some(serde_json::json!("Write tests"))
        );
    }
}
