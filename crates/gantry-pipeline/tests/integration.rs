//! End-to-end engine scenarios: linear runs, retry-and-branch, human
//! gates, parallel fan-out, checkpoint resume, sub-pipelines, and
//! cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use gantry_pipeline::{
    default_registry, default_registry_with_interviewer, load_checkpoint, load_graph,
    save_checkpoint, Answer, Backend, BackendResult, Engine, EngineConfig, EngineEvent,
    EventEmitter, Interviewer, PipelineStatus, Question, RetryPolicy, RunContext, ScriptedBackend,
    SimulationBackend,
};
use gantry_types::{GantryError, Result, StageStatus};

fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        name: "test",
        max_attempts,
        base_delay: Duration::ZERO,
        multiplier: 1.0,
        jitter_fraction: 0.0,
    }
}

fn engine_with(backend: Arc<dyn Backend>, config: EngineConfig) -> Engine {
    Engine::new(default_registry(backend), config)
}

fn collect_events(
    rx: &mut tokio::sync::broadcast::Receiver<gantry_pipeline::EventEnvelope>,
) -> Vec<gantry_pipeline::EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenario: linear pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline_checkpoints_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(
        Arc::new(SimulationBackend),
        EngineConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        },
    );

    let source = r#"digraph p { start [shape="Mdiamond"]; done [shape="Msquare"]; start -> done }"#;
    let graph = load_graph(source).unwrap();
    let run = RunContext::new(source);
    let emitter = EventEmitter::new(run.run_id().to_string());
    let mut rx = emitter.subscribe();

    let report = engine.run_graph(&graph, &run, &emitter).await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(report.completed_nodes, vec!["start", "done"]);

    let events = collect_events(&mut rx);
    let checkpoint_count = events
        .iter()
        .filter(|e| matches!(e.event, EngineEvent::CheckpointSaved { .. }))
        .count();
    assert_eq!(checkpoint_count, 2, "one CheckpointSaved per node");

    // Ordinals increase monotonically.
    let ordinals: Vec<u64> = events.iter().map(|e| e.ordinal).collect();
    let mut sorted = ordinals.clone();
    sorted.sort_unstable();
    assert_eq!(ordinals, sorted);

    let saved = load_checkpoint(dir.path(), &report.run_id).unwrap().unwrap();
    assert_eq!(saved.completed_nodes, vec!["start", "done"]);
    assert_eq!(saved.last_node_id, "done");
    assert_eq!(saved.source_hash, run.source_hash());
}

// ---------------------------------------------------------------------------
// Scenario: decision branching with retry on FAIL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stage_retries_then_decision_routes_success() {
    let backend = ScriptedBackend::new(vec![
        Err(GantryError::BackendError {
            node: "stageA".into(),
            message: "transient failure".into(),
            retryable: true,
        }),
        Ok(BackendResult::success("second attempt passed")),
    ]);
    let engine = engine_with(
        backend.clone(),
        EngineConfig {
            retry: fast_retry(3),
            ..EngineConfig::default()
        },
    );

    let source = r#"digraph G {
        start [shape="Mdiamond"]
        stageA [prompt="Build", max_retries=2]
        gate [shape="diamond"]
        retry [prompt="Prepare retry"]
        done [shape="Msquare"]
        start -> stageA -> gate
        gate -> retry [condition="outcome=FAIL"]
        gate -> done [condition="outcome=SUCCESS"]
        retry -> stageA
    }"#;
    let graph = load_graph(source).unwrap();
    let run = RunContext::new(source);
    let emitter = EventEmitter::new(run.run_id().to_string());
    let mut rx = emitter.subscribe();

    let report = engine.run_graph(&graph, &run, &emitter).await.unwrap();
    assert_eq!(report.status, PipelineStatus::Completed);
    assert!(report.completed_nodes.contains(&"done".to_string()));
    assert!(!report.completed_nodes.contains(&"retry".to_string()));
    assert_eq!(backend.call_count(), 2);

    // Event order: StageFailed(stageA) then StageRetrying(stageA) then
    // StageCompleted(stageA).
    let kinds_for_stage_a: Vec<&'static str> = collect_events(&mut rx)
        .iter()
        .filter_map(|e| match &e.event {
            EngineEvent::StageFailed { node_id, .. } if node_id == "stageA" => Some("failed"),
            EngineEvent::StageRetrying { node_id, .. } if node_id == "stageA" => Some("retrying"),
            EngineEvent::StageCompleted { node_id, .. } if node_id == "stageA" => {
                Some("completed")
            }
            _ => None,
        })
        .collect();
    assert_eq!(kinds_for_stage_a, vec!["failed", "retrying", "completed"]);
}

#[tokio::test]
async fn exhausted_retries_fail_the_pipeline() {
    let backend = ScriptedBackend::new(vec![
        Err(GantryError::BackendError {
            node: "stageA".into(),
            message: "down".into(),
            retryable: true,
        }),
        Err(GantryError::BackendError {
            node: "stageA".into(),
            message: "down".into(),
            retryable: true,
        }),
    ]);
    let engine = engine_with(
        backend.clone(),
        EngineConfig {
            retry: fast_retry(5),
            ..EngineConfig::default()
        },
    );

    // max_retries=1 means two total attempts.
    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            stageA [prompt="Build", max_retries=1]
            done [shape="Msquare"]
            start -> stageA -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(backend.call_count(), 2);
    assert_eq!(
        report.outcomes.get("stageA").unwrap().status,
        StageStatus::Fail
    );
}

#[tokio::test]
async fn non_retriable_failure_skips_retry() {
    let backend = ScriptedBackend::new(vec![Err(GantryError::BackendError {
        node: "stageA".into(),
        message: "bad prompt".into(),
        retryable: false,
    })]);
    let engine = engine_with(
        backend.clone(),
        EngineConfig {
            retry: fast_retry(5),
            ..EngineConfig::default()
        },
    );

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            stageA [prompt="Build", max_retries=3]
            done [shape="Msquare"]
            start -> stageA -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(backend.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: human gate
// ---------------------------------------------------------------------------

struct DelayedInterviewer;

#[async_trait]
impl Interviewer for DelayedInterviewer {
    async fn ask(&self, _question: &Question) -> Result<Answer> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut data = HashMap::new();
        data.insert("decision".to_string(), serde_json::json!("approve"));
        Ok(Answer {
            choice: "approve".into(),
            text: None,
            data,
        })
    }
}

#[tokio::test]
async fn human_gate_injects_decision_and_proceeds() {
    let registry = default_registry_with_interviewer(
        Arc::new(SimulationBackend),
        Arc::new(DelayedInterviewer),
    );
    let engine = Engine::new(registry, EngineConfig::default());

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            gate [shape="hexagon", prompt="Approve?"]
            ship [prompt="Ship it"]
            halt [prompt="Stop here"]
            done [shape="Msquare"]
            start -> gate
            gate -> ship [label="approve"]
            gate -> halt [label="reject"]
            ship -> done
            halt -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    let gate = report.outcomes.get("gate").unwrap();
    assert_eq!(gate.status, StageStatus::Success);
    assert_eq!(gate.resolve("decision").as_deref(), Some("approve"));
    assert!(report.completed_nodes.contains(&"ship".to_string()));
    assert!(!report.completed_nodes.contains(&"halt".to_string()));
    assert_eq!(
        report.final_context.get("gate.decision"),
        Some(&serde_json::json!("approve"))
    );
}

// ---------------------------------------------------------------------------
// Scenario: parallel fan-out with one failing child
// ---------------------------------------------------------------------------

/// Fails for one specific node id, succeeds everywhere else.
struct FailsForNode(&'static str);

#[async_trait]
impl Backend for FailsForNode {
    async fn run(
        &self,
        _run: &RunContext,
        node: &gantry_pipeline::Node,
        _prompt: &str,
    ) -> Result<BackendResult> {
        if node.id == self.0 {
            return Err(GantryError::BackendError {
                node: node.id.clone(),
                message: "child blew up".into(),
                retryable: false,
            });
        }
        Ok(BackendResult::success(format!("{} ok", node.id)))
    }
}

#[tokio::test]
async fn parallel_failure_records_sibling_successes() {
    let engine = engine_with(
        Arc::new(FailsForNode("mid")),
        EngineConfig {
            retry: fast_retry(1),
            ..EngineConfig::default()
        },
    );

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            fork [shape="parallelogram"]
            left [prompt="a", max_retries=0]
            mid [prompt="b", max_retries=0]
            right [prompt="c", max_retries=0]
            join [shape="box", prompt="merge"]
            done [shape="Msquare"]
            start -> fork
            fork -> left
            fork -> mid
            fork -> right
            left -> join
            mid -> join
            right -> join
            join -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    let fork = report.outcomes.get("fork").unwrap();
    assert_eq!(fork.status, StageStatus::Fail);
    assert_eq!(
        report.outcomes.get("left").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(
        report.outcomes.get("right").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(
        report.outcomes.get("mid").unwrap().status,
        StageStatus::Fail
    );
    // The join node never ran.
    assert!(!report.completed_nodes.contains(&"join".to_string()));
}

#[tokio::test]
async fn parallel_success_continues_at_join() {
    let engine = engine_with(Arc::new(SimulationBackend), EngineConfig::default());

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            fork [shape="parallelogram"]
            left [prompt="a"]
            right [prompt="b"]
            join [prompt="merge"]
            done [shape="Msquare"]
            start -> fork
            fork -> left
            fork -> right
            left -> join
            right -> join
            join -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    for node in ["left", "right", "join", "done"] {
        assert!(
            report.completed_nodes.contains(&node.to_string()),
            "missing {node}"
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario: resume from checkpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_skips_completed_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let engine = engine_with(Arc::new(SimulationBackend), config);

    let source = r#"digraph G {
        start [shape="Mdiamond"]
        stageA [prompt="Build"]
        stageB [prompt="Test"]
        done [shape="Msquare"]
        start -> stageA -> stageB -> done
    }"#;
    let graph = load_graph(source).unwrap();

    // First run to completion, capturing the full completion order.
    let first = engine.run_source(source).await.unwrap();
    assert_eq!(first.status, PipelineStatus::Completed);

    // Simulate a crash after stageA: rewrite the checkpoint as if the
    // process died before stageB started.
    let mut checkpoint = load_checkpoint(dir.path(), &first.run_id).unwrap().unwrap();
    checkpoint.completed_nodes = vec!["start".into(), "stageA".into()];
    checkpoint.outcomes.shift_remove("stageB");
    checkpoint.outcomes.shift_remove("done");
    checkpoint.last_node_id = "stageA".into();
    save_checkpoint(dir.path(), &checkpoint).unwrap();

    // Resume under the same run id.
    let run = RunContext::resumed(source, ulid::Ulid::from_string(&first.run_id).unwrap());
    run.seed_progress(
        checkpoint.completed_nodes.clone(),
        checkpoint.outcomes.clone(),
    );
    run.context().apply_updates(checkpoint.context.clone()).await;
    let emitter = EventEmitter::new(run.run_id().to_string());
    let mut rx = emitter.subscribe();

    let resumed = engine
        .run_resumed(&graph, &run, &emitter, &checkpoint)
        .await
        .unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert_eq!(resumed.completed_nodes, first.completed_nodes);

    // No StageStarted for the already-completed nodes.
    let started: Vec<String> = collect_events(&mut rx)
        .iter()
        .filter_map(|e| match &e.event {
            EngineEvent::StageStarted { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect();
    assert!(!started.contains(&"stageA".to_string()));
    assert!(started.contains(&"stageB".to_string()));
}

#[tokio::test]
async fn resume_refuses_source_hash_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..EngineConfig::default()
    };
    let engine = engine_with(Arc::new(SimulationBackend), config);

    let source = r#"digraph G {
        start [shape="Mdiamond"]
        work [prompt="x"]
        done [shape="Msquare"]
        start -> work -> done
    }"#;
    let report = engine.run_source(source).await.unwrap();

    let edited = source.replace("prompt=\"x\"", "prompt=\"y\"");
    let err = engine.resume(&edited, &report.run_id).await.unwrap_err();
    assert!(matches!(err, GantryError::SourceHashMismatch { .. }));

    // The unmodified source resumes fine (and is already complete).
    let resumed = engine.resume(source, &report.run_id).await.unwrap();
    assert_eq!(resumed.status, PipelineStatus::Completed);
}

// ---------------------------------------------------------------------------
// Sub-pipelines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subpipeline_forwards_and_captures_context() {
    let engine = engine_with(Arc::new(SimulationBackend), EngineConfig::default());

    let child = r#"digraph Child {
        start [shape=\"Mdiamond\"]
        inner [prompt=\"inner work\"]
        done [shape=\"Msquare\"]
        start -> inner -> done
    }"#;
    let source = format!(
        r#"digraph Parent {{
        start [shape="Mdiamond"]
        seed [prompt="seed"]
        sub [type="subpipeline", graph_dot="{child}", context_forward="outcome", context_capture="inner.summary"]
        done [shape="Msquare"]
        start -> seed -> sub -> done
    }}"#
    );

    let report = engine.run_source(&source).await.unwrap();
    assert_eq!(report.status, PipelineStatus::Completed);

    let sub = report.outcomes.get("sub").unwrap();
    assert_eq!(sub.status, StageStatus::Success);
    assert!(sub.data.contains_key("child_run_id"));
    // Captured from the child run.
    assert!(report.final_context.contains_key("inner.summary"));
}

#[tokio::test]
async fn subpipeline_with_invalid_child_fails_without_retry() {
    let backend = ScriptedBackend::new(vec![]);
    let engine = engine_with(
        backend,
        EngineConfig {
            retry: fast_retry(5),
            ..EngineConfig::default()
        },
    );

    // Two start sentinels make the child graph invalid in a way no
    // transform can repair.
    let source = r#"digraph Parent {
        start [shape="Mdiamond"]
        sub [type="subpipeline", graph_dot="digraph C { a [shape=\"Mdiamond\"]; b [shape=\"Mdiamond\"]; done [shape=\"Msquare\"]; a -> done; b -> done }", max_retries=3]
        done [shape="Msquare"]
        start -> sub -> done
    }"#;

    let report = engine.run_source(source).await.unwrap();
    assert_eq!(report.status, PipelineStatus::Failed);
    let sub = report.outcomes.get("sub").unwrap();
    assert!(sub.message.as_ref().unwrap().contains("subpipeline invalid"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

struct SlowBackend;

#[async_trait]
impl Backend for SlowBackend {
    async fn run(
        &self,
        run: &RunContext,
        _node: &gantry_pipeline::Node,
        _prompt: &str,
    ) -> Result<BackendResult> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            _ = run.cancel_token().cancelled() => {}
        }
        Ok(BackendResult::success("slow"))
    }
}

#[tokio::test]
async fn cancellation_marks_run_cancelled() {
    let engine = engine_with(
        Arc::new(SlowBackend),
        EngineConfig {
            grace_period: Duration::from_millis(100),
            ..EngineConfig::default()
        },
    );

    let source = r#"digraph G {
        start [shape="Mdiamond"]
        slow [prompt="never finishes"]
        done [shape="Msquare"]
        start -> slow -> done
    }"#;
    let graph = load_graph(source).unwrap();
    let run = RunContext::new(source);
    let emitter = EventEmitter::new(run.run_id().to_string());

    let canceller = run.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let report = engine.run_graph(&graph, &run, &emitter).await.unwrap();
    assert_eq!(report.status, PipelineStatus::Cancelled);
    assert_eq!(
        report.outcomes.get("slow").unwrap().status,
        StageStatus::Cancelled
    );
    assert!(!report.completed_nodes.contains(&"done".to_string()));
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

struct NeverFinishes;

#[async_trait]
impl Backend for NeverFinishes {
    async fn run(
        &self,
        _run: &RunContext,
        _node: &gantry_pipeline::Node,
        _prompt: &str,
    ) -> Result<BackendResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(BackendResult::success("unreachable"))
    }
}

#[tokio::test]
async fn node_timeout_fails_with_timeout_reason() {
    let engine = engine_with(
        Arc::new(NeverFinishes),
        EngineConfig {
            retry: fast_retry(1),
            default_node_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        },
    );

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            stuck [prompt="x", max_retries=0]
            done [shape="Msquare"]
            start -> stuck -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    let stuck = report.outcomes.get("stuck").unwrap();
    assert!(stuck.message.as_ref().unwrap().contains("timeout"));
}

// ---------------------------------------------------------------------------
// Retry target back-edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_verify_routes_through_retry_edge() {
    // verify fails on its first execution, succeeds after implement re-runs.
    let backend = ScriptedBackend::new(vec![
        Ok(BackendResult::success("implement v1")),
        Err(GantryError::BackendError {
            node: "verify".into(),
            message: "tests failed".into(),
            retryable: false,
        }),
        Ok(BackendResult::success("implement v2")),
        Ok(BackendResult::success("verify passed")),
    ]);
    let engine = engine_with(
        backend.clone(),
        EngineConfig {
            retry: fast_retry(1),
            ..EngineConfig::default()
        },
    );

    let report = engine
        .run_source(
            r#"digraph G {
            start [shape="Mdiamond"]
            implement [prompt="implement", max_retries=2]
            verify [prompt="verify", max_retries=0, retry_target="implement"]
            done [shape="Msquare"]
            start -> implement -> verify -> done
        }"#,
        )
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(backend.call_count(), 4);
    assert_eq!(
        report.outcomes.get("verify").unwrap().status,
        StageStatus::Success
    );
}
