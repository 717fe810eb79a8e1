//! WaitHumanHandler — pauses pipeline execution for human input.

use std::sync::Arc;

use async_trait::async_trait;

use gantry_types::{Outcome, Result, StageStatus};

use crate::graph::{Graph, Node};
use crate::handler::NodeHandler;
use crate::interviewer::{Interviewer, Question};
use crate::run::RunContext;

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    fn is_retriable(&self, _outcome: &Outcome) -> bool {
        // A disconnected or refused interviewer will not answer differently
        // on a second ask.
        false
    }

    async fn execute(&self, run: &RunContext, node: &Node, graph: &Graph) -> Result<Outcome> {
        let edges = graph.outgoing_edges(&node.id);
        let choices: Vec<String> = edges.iter().filter_map(|e| e.label.clone()).collect();

        let question = Question {
            run_id: run.run_id().to_string(),
            node_id: node.id.clone(),
            prompt: node.prompt.clone().unwrap_or_else(|| node.label.clone()),
            choices: if choices.is_empty() {
                vec!["Continue".into()]
            } else {
                choices
            },
            default: None,
            timeout: node.timeout,
        };

        let answer = tokio::select! {
            answer = self.interviewer.ask(&question) => answer?,
            _ = run.cancel_token().cancelled() => {
                return Ok(Outcome::with_status(StageStatus::Cancelled));
            }
        };

        // Inject the response into the run context keyed by node id so
        // downstream conditions can reference it.
        run.context()
            .set(
                format!("{}.decision", node.id),
                serde_json::json!(answer.choice.clone()),
            )
            .await;
        if let Some(ref text) = answer.text {
            run.context()
                .set(format!("{}.text", node.id), serde_json::json!(text.clone()))
                .await;
        }
        for (key, value) in &answer.data {
            run.context()
                .set(format!("{}.{key}", node.id), value.clone())
                .await;
        }

        let mut outcome = Outcome::success("Human responded")
            .with_data("decision", serde_json::json!(answer.choice.clone()))
            .with_label(answer.choice);
        for (key, value) in answer.data {
            outcome.data.insert(key, value);
        }
        Ok(outcome)
    }
}
