//! Pipeline execution engine — the core traversal loop.
//!
//! Drives a validated [`Graph`] from its start sentinel to an exit
//! sentinel: dispatching handlers under per-node timeouts, retrying per
//! policy, persisting a checkpoint after every settled node, selecting
//! edges from outcomes and conditions, fanning out parallel branches, and
//! recursing into sub-pipelines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use gantry_types::{GantryError, Outcome, Result, StageStatus};

use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointRecord};
use crate::edge_selection::{select_edge, select_fail_route, select_fanout, FailRoute};
use crate::events::{EngineEvent, EventEmitter};
use crate::goal_gate::check_goal_gates;
use crate::graph::{EdgeKind, Graph, Node};
use crate::handler::HandlerRegistry;
use crate::retry::{Jitter, RetryPolicy};
use crate::run::RunContext;
use crate::transforms::TransformRegistry;
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

pub struct EngineConfig {
    /// Where checkpoints land; `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    /// Timeout for a single handler invocation unless the node overrides it.
    pub default_node_timeout: Duration,
    /// How long cancelled or timed-out handlers get to wind down.
    pub grace_period: Duration,
    pub retry: RetryPolicy,
    /// Seed for backoff jitter; `None` draws from entropy.
    pub jitter_seed: Option<u64>,
    /// Hard cap on node dispatches per run, against runaway loops.
    pub max_steps: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            default_node_timeout: Duration::from_secs(600),
            grace_period: Duration::from_secs(5),
            retry: RetryPolicy::standard(),
            jitter_seed: None,
            max_steps: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// The result of a terminated pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: PipelineStatus,
    pub completed_nodes: Vec<String>,
    pub outcomes: IndexMap<String, Outcome>,
    pub final_context: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

/// Parse, transform, build, and validate a pipeline from DOT source.
pub fn load_graph(source: &str) -> Result<Graph> {
    let mut ast = gantry_dot::parse(source)?;
    TransformRegistry::with_defaults().apply_all(&mut ast)?;
    let graph = Graph::from_dot(&ast)?;
    validate_or_raise(&graph)?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse, validate, and run DOT source as a fresh pipeline.
    pub async fn run_source(&self, source: &str) -> Result<RunReport> {
        let graph = load_graph(source)?;
        let run = RunContext::new(source);
        let emitter = EventEmitter::new(run.run_id().to_string());
        self.run_graph(&graph, &run, &emitter).await
    }

    /// Resume a checkpointed run against the same source.
    ///
    /// Refuses when the stored source hash differs from the submitted
    /// source; a fresh run is the only way forward then.
    pub async fn resume(&self, source: &str, run_id: &str) -> Result<RunReport> {
        let dir = self.config.checkpoint_dir.as_ref().ok_or_else(|| {
            GantryError::Other("resume requires a checkpoint directory".into())
        })?;
        let checkpoint = load_checkpoint(dir, run_id)?.ok_or_else(|| {
            GantryError::Other(format!("no checkpoint found for run '{run_id}'"))
        })?;

        let graph = load_graph(source)?;
        let run = RunContext::new(source);
        if checkpoint.source_hash != run.source_hash() {
            return Err(GantryError::SourceHashMismatch {
                run_id: run_id.to_string(),
            });
        }

        let resumed_id = Ulid::from_string(run_id)
            .map_err(|e| GantryError::Other(format!("invalid run id '{run_id}': {e}")))?;
        let run = RunContext::resumed(source, resumed_id);
        run.seed_progress(
            checkpoint.completed_nodes.clone(),
            checkpoint.outcomes.clone(),
        );
        run.context().apply_updates(checkpoint.context.clone()).await;

        let emitter = EventEmitter::new(run.run_id().to_string());
        self.run_resumed(&graph, &run, &emitter, &checkpoint).await
    }

    /// Continue a seeded run from the checkpoint frontier.
    pub async fn run_resumed(
        &self,
        graph: &Graph,
        run: &RunContext,
        emitter: &EventEmitter,
        checkpoint: &CheckpointRecord,
    ) -> Result<RunReport> {
        // Walk forward from the last checkpointed node through completed
        // territory to find the frontier. Completed nodes get no
        // StageStarted on the resumed run. The hop budget guards against
        // cycles of completed nodes in checkpoints from older builds.
        let mut current = checkpoint.last_node_id.clone();
        let mut hops = 0usize;
        loop {
            if !run.is_completed(&current) {
                break;
            }
            hops += 1;
            if hops > graph.node_count() {
                return Ok(self.report(run, PipelineStatus::Completed, None).await);
            }
            let node = graph
                .node(&current)
                .ok_or_else(|| GantryError::Other(format!("node '{current}' not in graph")))?;
            if is_exit(node) {
                // The run already finished; report it as such.
                return Ok(self.report(run, PipelineStatus::Completed, None).await);
            }
            let outcome = run
                .outcome_of(&current)
                .unwrap_or_else(|| Outcome::success(""));
            let snapshot = run.context().snapshot().await;
            let resolver = make_resolver(&outcome, &snapshot);
            match select_edge(&current, &outcome, &resolver, graph) {
                Some(edge) => current = edge.to.clone(),
                None => {
                    return Ok(self.report(run, PipelineStatus::Completed, None).await);
                }
            }
        }
        self.drive(graph, run, emitter, current).await
    }

    /// Run a prepared graph under an existing run context.
    pub async fn run_graph(
        &self,
        graph: &Graph,
        run: &RunContext,
        emitter: &EventEmitter,
    ) -> Result<RunReport> {
        let start = graph
            .start_node()
            .ok_or_else(|| GantryError::ValidationError("No start node found".into()))?;
        self.drive(graph, run, emitter, start.id.clone()).await
    }

    // -----------------------------------------------------------------------
    // Core loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        graph: &Graph,
        run: &RunContext,
        emitter: &EventEmitter,
        start_from: String,
    ) -> Result<RunReport> {
        emitter.emit(EngineEvent::PipelineStarted {
            pipeline_name: graph.name.clone(),
            node_count: graph.node_count(),
        });

        let mut jitter = match self.config.jitter_seed {
            Some(seed) => Jitter::seeded(seed),
            None => Jitter::new(),
        };
        // Dispatch attempts for the node currently being retried.
        let mut attempts: HashMap<String, usize> = HashMap::new();
        // How many times each node has been re-entered via a retry route.
        let mut retry_visits: HashMap<String, usize> = HashMap::new();
        let mut steps: u64 = 0;
        let mut current = start_from;

        loop {
            if run.is_cancelled() {
                return Ok(self.finish_cancelled(run, emitter, "run cancelled").await);
            }
            steps += 1;
            if steps > self.config.max_steps {
                let reason = format!("step limit {} exceeded", self.config.max_steps);
                emitter.emit(EngineEvent::PipelineFailed {
                    reason: reason.clone(),
                });
                return Ok(self.report(run, PipelineStatus::Failed, Some(reason)).await);
            }

            let node = graph
                .node(&current)
                .ok_or_else(|| GantryError::Other(format!("node '{current}' not in graph")))?
                .clone();
            run.set_current_node(Some(&node.id));

            // Exit sentinel: enforce goal gates, then finish.
            if is_exit(&node) {
                let gates = check_goal_gates(graph, &run.outcomes());
                if !gates.all_satisfied {
                    let failed = gates.failed_node_id.unwrap_or_default();
                    if let Some(target) = gates.retry_target {
                        let cap = retry_cap(graph, &target, &self.config.retry);
                        let visits = retry_visits.entry(target.clone()).or_insert(0);
                        *visits += 1;
                        if *visits <= cap {
                            tracing::info!(gate = %failed, target = %target, "Goal gate unsatisfied, looping to retry target");
                            run.reopen_node(&target);
                            run.reopen_node(&failed);
                            attempts.remove(&target);
                            attempts.remove(&failed);
                            current = target;
                            continue;
                        }
                    }
                    let reason =
                        format!("goal gate unsatisfied: node '{failed}' did not reach SUCCESS");
                    emitter.emit(EngineEvent::PipelineFailed {
                        reason: reason.clone(),
                    });
                    return Ok(self.report(run, PipelineStatus::Failed, Some(reason)).await);
                }

                let outcome = self.dispatch(&node, graph, run, emitter).await?;
                run.record_outcome(&node.id, outcome.clone());
                self.write_checkpoint(run, &node.id, emitter).await;
                emitter.emit(EngineEvent::PipelineCompleted {
                    completed_nodes: run.completed_nodes(),
                    outcome: Box::new(outcome),
                });
                return Ok(self.report(run, PipelineStatus::Completed, None).await);
            }

            // Dispatch with per-node retry.
            let attempt = {
                let entry = attempts.entry(node.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let handler_type = self.registry.resolve_type(&node);
            emitter.emit(EngineEvent::StageStarted {
                node_id: node.id.clone(),
                handler_type: handler_type.clone(),
            });

            let started = std::time::Instant::now();
            let mut outcome = self.dispatch(&node, graph, run, emitter).await?;
            outcome.duration_ms = Some(started.elapsed().as_millis() as u64);

            match outcome.status {
                StageStatus::Cancelled => {
                    run.record_outcome(&node.id, outcome);
                    self.write_checkpoint(run, &node.id, emitter).await;
                    return Ok(self
                        .finish_cancelled(run, emitter, "run cancelled during stage")
                        .await);
                }
                StageStatus::Fail => {
                    let reason = outcome
                        .message
                        .clone()
                        .unwrap_or_else(|| "stage failed".into());
                    emitter.emit(EngineEvent::StageFailed {
                        node_id: node.id.clone(),
                        reason: reason.clone(),
                    });

                    let budget = self.config.retry.attempts_for(node.max_retries);
                    let retriable = self
                        .registry
                        .get(&handler_type)
                        .map(|h| h.is_retriable(&outcome))
                        .unwrap_or(true);
                    if retriable && attempt < budget {
                        let delay = self.config.retry.backoff(attempt, &mut jitter);
                        emitter.emit(EngineEvent::StageRetrying {
                            node_id: node.id.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        tracing::info!(node = %node.id, attempt, delay_ms = %delay.as_millis(), "Retrying stage");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = run.cancel_token().cancelled() => {}
                        }
                        continue;
                    }

                    // Final failure for this visit.
                    attempts.remove(&node.id);
                    run.record_outcome(&node.id, outcome.clone());
                    self.write_checkpoint(run, &node.id, emitter).await;

                    let snapshot = run.context().snapshot().await;
                    let resolver = make_resolver(&outcome, &snapshot);
                    match select_fail_route(&node.id, &resolver, graph) {
                        Some(FailRoute::Edge(next)) => {
                            self.prepare_revisit(run, &mut attempts, &next);
                            current = next;
                        }
                        Some(FailRoute::Retry(target)) => {
                            let cap = retry_cap(graph, &target, &self.config.retry);
                            let visits = retry_visits.entry(target.clone()).or_insert(0);
                            *visits += 1;
                            if *visits > cap {
                                let reason = format!(
                                    "retry target '{target}' exhausted after {cap} visits"
                                );
                                emitter.emit(EngineEvent::PipelineFailed {
                                    reason: reason.clone(),
                                });
                                return Ok(self
                                    .report(run, PipelineStatus::Failed, Some(reason))
                                    .await);
                            }
                            self.prepare_revisit(run, &mut attempts, &target);
                            run.reopen_node(&node.id);
                            current = target;
                        }
                        None => {
                            emitter.emit(EngineEvent::PipelineFailed {
                                reason: reason.clone(),
                            });
                            return Ok(self
                                .report(run, PipelineStatus::Failed, Some(reason))
                                .await);
                        }
                    }
                }
                StageStatus::Success | StageStatus::Skipped | StageStatus::Retrying => {
                    attempts.remove(&node.id);
                    emitter.emit(EngineEvent::StageCompleted {
                        node_id: node.id.clone(),
                        status: outcome.status.as_str().to_string(),
                        duration_ms: outcome.duration_ms.unwrap_or(0),
                    });
                    run.record_outcome(&node.id, outcome.clone());
                    // Decision nodes are pass-throughs: they route on their
                    // predecessor's status, so they must not overwrite it.
                    if handler_type != "decision" {
                        run.context()
                            .set("outcome", serde_json::json!(outcome.status.as_str()))
                            .await;
                    }
                    self.write_checkpoint(run, &node.id, emitter).await;

                    // Next hop. Parallel nodes jump to the join target:
                    // their outgoing edges are the already-run branches.
                    let next = if handler_type == "parallel" {
                        parallel_join_target(graph, &node)
                    } else {
                        let snapshot = run.context().snapshot().await;
                        let resolver: Box<dyn Fn(&str) -> String + '_> =
                            if handler_type == "decision" {
                                Box::new(make_context_resolver(&snapshot))
                            } else {
                                Box::new(make_resolver(&outcome, &snapshot))
                            };
                        select_edge(&node.id, &outcome, &*resolver, graph).map(|edge| {
                            if edge.loop_restart {
                                tracing::info!(edge_to = %edge.to, "Loop restart edge taken");
                                run.reset_progress();
                                attempts.clear();
                                retry_visits.clear();
                            }
                            edge.to.clone()
                        })
                    };

                    match next {
                        Some(next_id) => {
                            self.prepare_revisit(run, &mut attempts, &next_id);
                            current = next_id;
                        }
                        None => {
                            // Terminal without an exit sentinel.
                            emitter.emit(EngineEvent::PipelineCompleted {
                                completed_nodes: run.completed_nodes(),
                                outcome: Box::new(outcome),
                            });
                            return Ok(self.report(run, PipelineStatus::Completed, None).await);
                        }
                    }
                }
            }
        }
    }

    /// Back-edges may legally re-enter a completed node; the engine reopens
    /// it so the handler runs again.
    fn prepare_revisit(
        &self,
        run: &RunContext,
        attempts: &mut HashMap<String, usize>,
        node_id: &str,
    ) {
        if run.is_completed(node_id) {
            run.reopen_node(node_id);
            attempts.remove(node_id);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        node: &Node,
        graph: &Graph,
        run: &RunContext,
        emitter: &EventEmitter,
    ) -> Result<Outcome> {
        let handler_type = self.registry.resolve_type(node);

        // Structural types the engine executes itself.
        if handler_type == "parallel" && !graph.outgoing_edges(&node.id).is_empty() {
            return self.run_parallel(node, graph, run).await;
        }
        if handler_type == "subpipeline" {
            return self.run_subpipeline(node, run, emitter).await;
        }

        let handler = self.registry.get(&handler_type).ok_or_else(|| {
            GantryError::HandlerError {
                handler: handler_type.clone(),
                node: node.id.clone(),
                message: format!("No handler registered for type '{handler_type}'"),
            }
        })?;

        let timeout = node.timeout.unwrap_or(self.config.default_node_timeout);
        let fut = handler.execute(run, node, graph);
        tokio::pin!(fut);

        let result = tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(node = %node.id, timeout_ms = %timeout.as_millis(), "Stage timed out");
                return Ok(Outcome::fail(format!(
                    "timeout after {}ms",
                    timeout.as_millis()
                )));
            }
            _ = run.cancel_token().cancelled() => {
                // Grace window for the handler to observe the signal.
                match tokio::time::timeout(self.config.grace_period, &mut fut).await {
                    Ok(Ok(outcome)) if outcome.status == StageStatus::Cancelled => Ok(outcome),
                    _ => Ok(Outcome::with_status(StageStatus::Cancelled)),
                }
            }
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if run.is_cancelled() => {
                tracing::debug!(node = %node.id, error = %e, "Handler error during cancellation");
                Ok(Outcome::with_status(StageStatus::Cancelled))
            }
            Err(e) => {
                let retryable = e.is_retryable();
                Ok(Outcome::fail(e.to_string())
                    .with_data("retryable", serde_json::json!(retryable)))
            }
        }
    }

    /// Run the branch targets of a parallel node concurrently and join.
    ///
    /// Each branch is the single node at the far end of one outgoing edge;
    /// its outcome is recorded on the run as if the engine had visited it.
    /// The parallel node fails when any branch final-fails, and retrying it
    /// re-runs every branch.
    async fn run_parallel(&self, node: &Node, graph: &Graph, run: &RunContext) -> Result<Outcome> {
        let snapshot = run.context().snapshot().await;
        let no_outcome = Outcome::success("");
        let resolver = make_resolver(&no_outcome, &snapshot);
        let branch_ids: Vec<String> = select_fanout(&node.id, &resolver, graph)
            .iter()
            .map(|e| e.to.clone())
            .collect();
        if branch_ids.is_empty() {
            return Ok(Outcome::fail("parallel node has no matching branches")
                .with_data("retryable", serde_json::json!(false)));
        }

        tracing::info!(node = %node.id, branches = branch_ids.len(), "Parallel fan-out");

        let graph = Arc::new(graph.clone());
        let mut tasks = tokio::task::JoinSet::new();
        for branch_id in branch_ids.clone() {
            let registry = Arc::clone(&self.registry);
            let graph = Arc::clone(&graph);
            let run = run.clone();
            let timeout_default = self.config.default_node_timeout;
            tasks.spawn(async move {
                let Some(branch) = graph.node(&branch_id).map(Clone::clone) else {
                    return (
                        branch_id.clone(),
                        Outcome::fail(format!("branch node '{branch_id}' not in graph")),
                    );
                };
                let handler_type = registry.resolve_type(&branch);
                let Some(handler) = registry.get(&handler_type) else {
                    return (
                        branch_id,
                        Outcome::fail(format!("no handler for type '{handler_type}'")),
                    );
                };
                let timeout = branch.timeout.unwrap_or(timeout_default);
                let outcome = tokio::select! {
                    result = handler.execute(&run, &branch, &graph) => match result {
                        Ok(outcome) => outcome,
                        Err(e) => Outcome::fail(e.to_string()),
                    },
                    _ = tokio::time::sleep(timeout) => {
                        Outcome::fail(format!("timeout after {}ms", timeout.as_millis()))
                    }
                    _ = run.cancel_token().cancelled() => Outcome::with_status(StageStatus::Cancelled),
                };
                (branch_id, outcome)
            });
        }

        let mut failed: Vec<String> = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            let (branch_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "Parallel branch task panicked");
                    continue;
                }
            };
            if outcome.status == StageStatus::Fail {
                failed.push(branch_id.clone());
            }
            if outcome.status == StageStatus::Cancelled {
                cancelled = true;
            }
            run.record_outcome(&branch_id, outcome);
        }

        if cancelled {
            return Ok(Outcome::with_status(StageStatus::Cancelled));
        }
        if !failed.is_empty() {
            failed.sort();
            return Ok(Outcome::fail(format!(
                "{} of {} branches failed: {}",
                failed.len(),
                branch_ids.len(),
                failed.join(", ")
            ))
            .with_data("failed_branches", serde_json::json!(failed)));
        }
        Ok(
            Outcome::success(format!("{} branches completed", branch_ids.len()))
                .with_data("branches", serde_json::json!(branch_ids)),
        )
    }

    /// Run a child pipeline under a derived run context.
    async fn run_subpipeline(
        &self,
        node: &Node,
        run: &RunContext,
        emitter: &EventEmitter,
    ) -> Result<Outcome> {
        let source = if let Some(ref inline) = node.graph_dot {
            inline.clone()
        } else if let Some(ref path) = node.graph_ref {
            match std::fs::read_to_string(path) {
                Ok(source) => source,
                Err(e) => {
                    return Ok(Outcome::fail(format!(
                        "cannot read graph_ref '{path}': {e}"
                    ))
                    .with_data("retryable", serde_json::json!(false)));
                }
            }
        } else {
            return Ok(Outcome::fail(
                "subpipeline node declares neither graph_ref nor graph_dot",
            )
            .with_data("retryable", serde_json::json!(false)));
        };

        // Child parse/validation failures are permanent.
        let child_graph = match load_graph(&source) {
            Ok(graph) => graph,
            Err(e) => {
                return Ok(Outcome::fail(format!("subpipeline invalid: {e}"))
                    .with_data("retryable", serde_json::json!(false)));
            }
        };

        let child_run = run.child(&source, &node.context_forward).await;
        let child_id = child_run.run_id().to_string();
        tracing::info!(parent = %run.run_id(), child = %child_id, node = %node.id, "Starting sub-pipeline");

        // Child events flow through the parent's emitter so subscribers see
        // the whole tree; the parent run id stays on the envelope.
        let report = Box::pin(self.run_graph(&child_graph, &child_run, emitter)).await?;

        match report.status {
            PipelineStatus::Completed => {
                for key in &node.context_capture {
                    if let Some(value) = child_run.context().get(key).await {
                        run.context().set(key.clone(), value).await;
                    }
                }
                Ok(Outcome::success(format!(
                    "sub-pipeline '{}' completed",
                    child_graph.name
                ))
                .with_data("child_run_id", serde_json::json!(child_id)))
            }
            PipelineStatus::Cancelled => Ok(Outcome::with_status(StageStatus::Cancelled)),
            _ => Ok(Outcome::fail(format!(
                "sub-pipeline '{}' failed: {}",
                child_graph.name,
                report.error.unwrap_or_else(|| "unknown".into())
            ))
            .with_data("child_run_id", serde_json::json!(child_id))),
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    async fn write_checkpoint(&self, run: &RunContext, last_node: &str, emitter: &EventEmitter) {
        let Some(ref dir) = self.config.checkpoint_dir else {
            return;
        };
        let record = CheckpointRecord {
            run_id: run.run_id().to_string(),
            source_hash: run.source_hash().to_string(),
            completed_nodes: run.completed_nodes(),
            outcomes: run.outcomes(),
            context: run.context().snapshot().await,
            last_node_id: last_node.to_string(),
            saved_at: chrono::Utc::now(),
        };
        // A failed checkpoint write must not kill the run; the next
        // successful write supersedes it.
        match save_checkpoint(dir, &record) {
            Ok(_) => {
                emitter.emit(EngineEvent::CheckpointSaved {
                    node_id: last_node.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(run = %run.run_id(), error = %e, "Checkpoint write failed");
            }
        }
    }

    async fn finish_cancelled(
        &self,
        run: &RunContext,
        emitter: &EventEmitter,
        reason: &str,
    ) -> RunReport {
        emitter.emit(EngineEvent::PipelineFailed {
            reason: reason.to_string(),
        });
        self.report(run, PipelineStatus::Cancelled, Some(reason.to_string()))
            .await
    }

    async fn report(
        &self,
        run: &RunContext,
        status: PipelineStatus,
        error: Option<String>,
    ) -> RunReport {
        run.set_current_node(None);
        RunReport {
            run_id: run.run_id().to_string(),
            status,
            completed_nodes: run.completed_nodes(),
            outcomes: run.outcomes(),
            final_context: run.context().snapshot().await,
            error,
        }
    }
}

fn is_exit(node: &Node) -> bool {
    node.shape == "Msquare" || node.node_type.as_deref() == Some("exit")
}

/// Retry budget for re-entering `target` via retry routes.
fn retry_cap(graph: &Graph, target: &str, policy: &RetryPolicy) -> usize {
    graph
        .node(target)
        .and_then(|n| n.max_retries)
        .unwrap_or_else(|| policy.max_attempts.saturating_sub(1))
        .max(1)
}

/// The node all parallel branches converge on: the common forward target of
/// every branch, when one exists.
fn parallel_join_target(graph: &Graph, parallel: &Node) -> Option<String> {
    let branches: Vec<&str> = graph
        .outgoing_edges(&parallel.id)
        .iter()
        .filter(|e| e.kind == EdgeKind::Forward)
        .map(|e| e.to.as_str())
        .collect();
    let mut common: Option<Vec<String>> = None;
    for branch in &branches {
        let targets: Vec<String> = graph
            .outgoing_edges(branch)
            .iter()
            .filter(|e| e.kind == EdgeKind::Forward)
            .map(|e| e.to.clone())
            .collect();
        common = Some(match common {
            None => targets,
            Some(prev) => prev.into_iter().filter(|t| targets.contains(t)).collect(),
        });
    }
    common.and_then(|c| c.into_iter().next())
}

fn make_resolver<'a>(
    outcome: &'a Outcome,
    context: &'a HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> String + 'a {
    move |key: &str| {
        if let Some(value) = outcome.resolve(key) {
            return value;
        }
        resolve_context_value(context, key)
    }
}

/// Resolver that sees only the shared context. Decision gates use this so
/// `outcome` refers to the predecessor's status rather than their own
/// pass-through success.
fn make_context_resolver(
    context: &HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> String + '_ {
    move |key: &str| resolve_context_value(context, key)
}

fn resolve_context_value(context: &HashMap<String, serde_json::Value>, key: &str) -> String {
    match context.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulationBackend;
    use crate::handler::default_registry;

    fn engine() -> Engine {
        Engine::new(
            default_registry(Arc::new(SimulationBackend)),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn linear_pipeline_completes() {
        let report = engine()
            .run_source(
                r#"digraph G {
                start [shape="Mdiamond"]
                process [prompt="Do work"]
                done [shape="Msquare"]
                start -> process -> done
            }"#,
            )
            .await
            .unwrap();

        assert_eq!(report.status, PipelineStatus::Completed);
        assert_eq!(report.completed_nodes, vec!["start", "process", "done"]);
        assert_eq!(
            report.outcomes.get("process").unwrap().status,
            StageStatus::Success
        );
    }

    #[tokio::test]
    async fn branching_routes_on_condition() {
        let report = engine()
            .run_source(
                r#"digraph G {
                start [shape="Mdiamond"]
                check [prompt="Check"]
                yes_path [prompt="Yes"]
                no_path [prompt="No"]
                done [shape="Msquare"]
                start -> check
                check -> yes_path [condition="outcome=success"]
                check -> no_path [condition="outcome=fail"]
                yes_path -> done
                no_path -> done
            }"#,
            )
            .await
            .unwrap();

        assert!(report.completed_nodes.contains(&"yes_path".to_string()));
        assert!(!report.completed_nodes.contains(&"no_path".to_string()));
    }

    #[tokio::test]
    async fn invalid_graph_refuses_to_run() {
        // Two start sentinels cannot be repaired by any transform.
        let err = engine()
            .run_source(
                r#"digraph G {
                a [shape="Mdiamond"]
                b [shape="Mdiamond"]
                done [shape="Msquare"]
                a -> done
                b -> done
            }"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::ValidationError(_)));
    }

    #[tokio::test]
    async fn final_context_carries_stage_outputs() {
        let report = engine()
            .run_source(
                r#"digraph G {
                start [shape="Mdiamond"]
                step [prompt="Generate code"]
                done [shape="Msquare"]
                start -> step -> done
            }"#,
            )
            .await
            .unwrap();

        assert_eq!(
            report.final_context.get("step.prompt"),
            Some(&serde_json::json!("Generate code"))
        );
        assert_eq!(
            report.final_context.get("outcome"),
            Some(&serde_json::json!("success"))
        );
    }

    #[test]
    fn parallel_join_target_finds_common_node() {
        let ast = gantry_dot::parse(
            r#"digraph G {
            fork [shape="parallelogram"]
            fork -> a
            fork -> b
            a -> join
            b -> join
            join -> done
        }"#,
        )
        .unwrap();
        let graph = Graph::from_dot(&ast).unwrap();
        let fork = graph.node("fork").unwrap();
        assert_eq!(parallel_join_target(&graph, fork), Some("join".into()));
    }

    #[test]
    fn parallel_join_target_none_when_divergent() {
        let ast = gantry_dot::parse(
            r#"digraph G {
            fork [shape="parallelogram"]
            fork -> a
            fork -> b
            a -> x
            b -> y
        }"#,
        )
        .unwrap();
        let graph = Graph::from_dot(&ast).unwrap();
        let fork = graph.node("fork").unwrap();
        assert_eq!(parallel_join_target(&graph, fork), None);
    }

    #[test]
    fn pipeline_status_strings() {
        assert_eq!(PipelineStatus::Completed.as_str(), "completed");
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }
}
