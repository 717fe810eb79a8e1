//! Run lifecycle management for the control plane.
//!
//! The manager owns one engine, submits pipelines onto background tasks,
//! keeps live handles (run context, event emitter, replayable event
//! history) while persisting every status transition through the
//! [`RunStateStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gantry_pipeline::{
    default_registry_with_interviewer, validate, Answer, Backend, ChannelInterviewer, Diagnostic,
    Engine, EngineConfig, EventEmitter, EventEnvelope, Graph, PipelineStatus, RunContext,
    Severity, TransformRegistry,
};
use gantry_types::GantryError;

use crate::run_store::{RunRecord, RunStateStore};

/// Why a submission was rejected.
#[derive(Debug)]
pub enum SubmitError {
    /// DOT parse failure: HTTP 400.
    Parse(GantryError),
    /// Validation errors: HTTP 422 with diagnostics.
    Validation(Vec<Diagnostic>),
}

/// Live handle to a run started by this process.
#[derive(Clone)]
pub struct RunHandle {
    pub run: RunContext,
    pub emitter: EventEmitter,
    pub history: Arc<Mutex<Vec<EventEnvelope>>>,
    pub source: String,
}

pub struct RunManager {
    engine: Arc<Engine>,
    store: RunStateStore,
    interviewer: Arc<ChannelInterviewer>,
    live: Mutex<HashMap<String, RunHandle>>,
}

impl RunManager {
    pub fn new(
        data_dir: impl Into<std::path::PathBuf>,
        backend: Arc<dyn Backend>,
        mut config: EngineConfig,
    ) -> Arc<Self> {
        let store = RunStateStore::new(data_dir);
        let interviewer = Arc::new(ChannelInterviewer::new());
        // Checkpoints live next to each run's state.json.
        config.checkpoint_dir = Some(store.runs_dir().to_path_buf());
        let registry = default_registry_with_interviewer(backend, interviewer.clone());
        Arc::new(Self {
            engine: Arc::new(Engine::new(registry, config)),
            store,
            interviewer,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    /// Parse, validate, and dispatch a pipeline. Returns the new run id.
    pub fn submit(
        self: &Arc<Self>,
        source: String,
        pipeline_file: Option<String>,
    ) -> Result<String, SubmitError> {
        let mut ast = gantry_dot::parse(&source).map_err(SubmitError::Parse)?;
        TransformRegistry::with_defaults()
            .apply_all(&mut ast)
            .map_err(SubmitError::Parse)?;
        let graph = Graph::from_dot(&ast).map_err(SubmitError::Parse)?;

        let diagnostics = validate(&graph);
        if diagnostics.iter().any(|d| d.severity == Severity::Error) {
            return Err(SubmitError::Validation(diagnostics));
        }

        let run = RunContext::new(source.clone());
        let run_id = run.run_id().to_string();
        let emitter = EventEmitter::new(run_id.clone());
        let handle = RunHandle {
            run: run.clone(),
            emitter: emitter.clone(),
            history: Arc::new(Mutex::new(Vec::new())),
            source: source.clone(),
        };
        self.live.lock().unwrap().insert(run_id.clone(), handle.clone());

        let record = RunRecord {
            id: run_id.clone(),
            pipeline_file,
            status: PipelineStatus::Running,
            source,
            source_hash: run.source_hash().to_string(),
            started_at: run.started_at(),
            completed_at: None,
            error: None,
            completed_nodes: Vec::new(),
            context: HashMap::new(),
        };
        if let Err(e) = self.store.save(&record) {
            tracing::error!(run = %run_id, error = %e, "Failed to persist run record");
        }

        // Mirror the event stream into the replay buffer.
        let mut rx = emitter.subscribe();
        let history = handle.history.clone();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                history.lock().unwrap().push(envelope);
            }
        });

        let manager = Arc::clone(self);
        let engine = Arc::clone(&self.engine);
        let id_for_task = run_id.clone();
        tokio::spawn(async move {
            let result = engine.run_graph(&graph, &run, &emitter).await;
            manager.finish(&id_for_task, record, result).await;
        });

        Ok(run_id)
    }

    async fn finish(
        &self,
        run_id: &str,
        mut record: RunRecord,
        result: gantry_types::Result<gantry_pipeline::RunReport>,
    ) {
        match result {
            Ok(report) => {
                record.status = report.status;
                record.completed_nodes = report.completed_nodes;
                record.context = report.final_context;
                record.error = report.error;
            }
            Err(e) => {
                record.status = PipelineStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.completed_at = Some(chrono::Utc::now());
        if let Err(e) = self.store.save(&record) {
            tracing::error!(run = %run_id, error = %e, "Failed to persist final run record");
        }
        tracing::info!(run = %run_id, status = record.status.as_str(), "Run finished");
    }

    /// Resume runs the last process left non-terminal.
    pub fn recover_runs(self: &Arc<Self>) {
        let records = match self.store.load_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Cannot list persisted runs");
                return;
            }
        };
        for record in records {
            if record.status.is_terminal() {
                continue;
            }
            tracing::info!(run = %record.id, "Recovering in-progress run");
            let manager = Arc::clone(self);
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let run_id = record.id.clone();
                let source = record.source.clone();
                let result = engine.resume(&source, &run_id).await;
                manager.finish(&run_id, record, result).await;
            });
        }
    }

    pub fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.live.lock().unwrap().get(run_id).cloned()
    }

    pub fn record(&self, run_id: &str) -> Option<RunRecord> {
        self.store.load(run_id).ok().flatten()
    }

    pub fn list(&self) -> Vec<RunRecord> {
        self.store.load_all().unwrap_or_default()
    }

    /// Raise cancellation for a live run. Returns `false` when the run is
    /// not live in this process.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.handle(run_id) {
            Some(handle) => {
                handle.run.cancel();
                true
            }
            None => false,
        }
    }

    /// Satisfy a pending human gate.
    pub fn answer_human(&self, run_id: &str, node_id: &str, answer: Answer) -> bool {
        self.interviewer.answer(run_id, node_id, answer)
    }

    /// (run id, node id) pairs currently waiting on a human.
    pub fn pending_questions(&self) -> Vec<(String, String)> {
        self.interviewer.pending_nodes()
    }

    /// Current snapshot of a run for the detail endpoint.
    pub async fn snapshot(&self, run_id: &str) -> Option<serde_json::Value> {
        let record = self.record(run_id)?;
        let mut body = serde_json::json!({
            "id": record.id,
            "status": record.status,
            "started_at": record.started_at,
            "completed_at": record.completed_at,
            "error": record.error,
            "pipeline_file": record.pipeline_file,
            "completed_nodes": record.completed_nodes,
            "context": record.context,
        });

        if let Some(handle) = self.handle(run_id) {
            body["completed_nodes"] = serde_json::json!(handle.run.completed_nodes());
            body["outcomes"] = serde_json::to_value(handle.run.outcomes()).unwrap_or_default();
            body["current_node"] = serde_json::json!(handle.run.current_node());
            body["context"] = serde_json::json!(handle.run.context().snapshot().await);
        } else if let Ok(Some(checkpoint)) = gantry_pipeline::load_checkpoint(
            self.store.runs_dir(),
            run_id,
        ) {
            body["outcomes"] = serde_json::to_value(checkpoint.outcomes).unwrap_or_default();
        }
        Some(body)
    }
}
