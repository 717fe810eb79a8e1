//! Per-run execution state shared between the engine and handlers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use gantry_types::{Context, Outcome};

struct RunImmutable {
    run_id: Ulid,
    started_at: DateTime<Utc>,
    source: String,
    source_hash: String,
}

#[derive(Default)]
struct RunState {
    completed: Vec<String>,
    outcomes: IndexMap<String, Outcome>,
    current_node: Option<String>,
}

/// Shared, cloneable handle to the state of one pipeline run.
///
/// The immutable header (id, source, hash) is fixed at creation. Mutable
/// state lives behind a mutex that is held only for the duration of a
/// snapshot or mutation; handlers run entirely outside it. The shared
/// key/value [`Context`] has its own async lock.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunImmutable>,
    state: Arc<Mutex<RunState>>,
    context: Context,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            inner: Arc::new(RunImmutable {
                run_id: Ulid::new(),
                started_at: Utc::now(),
                source_hash: hash_source(&source),
                source,
            }),
            state: Arc::new(Mutex::new(RunState::default())),
            context: Context::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Reconstruct a handle for a checkpointed run, keeping its original id.
    pub fn resumed(source: impl Into<String>, run_id: Ulid) -> Self {
        let source = source.into();
        Self {
            inner: Arc::new(RunImmutable {
                run_id,
                started_at: Utc::now(),
                source_hash: hash_source(&source),
                source,
            }),
            state: Arc::new(Mutex::new(RunState::default())),
            context: Context::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> Ulid {
        self.inner.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn source_hash(&self) -> &str {
        &self.inner.source_hash
    }

    /// The shared key/value map visible to handlers and edge conditions.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Raise the run's cancellation signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a node's outcome, marking it completed on first record.
    pub fn record_outcome(&self, node_id: &str, outcome: Outcome) {
        let mut state = self.state.lock().unwrap();
        if !state.completed.iter().any(|id| id == node_id) {
            state.completed.push(node_id.to_string());
        }
        state.outcomes.insert(node_id.to_string(), outcome);
    }

    /// Forget a node's completion so a back-edge can legally re-run it.
    pub fn reopen_node(&self, node_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.completed.retain(|id| id != node_id);
        state.outcomes.shift_remove(node_id);
    }

    /// Drop all completion records (loop restart).
    pub fn reset_progress(&self) {
        let mut state = self.state.lock().unwrap();
        state.completed.clear();
        state.outcomes.clear();
    }

    pub fn is_completed(&self, node_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .completed
            .iter()
            .any(|id| id == node_id)
    }

    pub fn completed_nodes(&self) -> Vec<String> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn outcomes(&self) -> IndexMap<String, Outcome> {
        self.state.lock().unwrap().outcomes.clone()
    }

    pub fn outcome_of(&self, node_id: &str) -> Option<Outcome> {
        self.state.lock().unwrap().outcomes.get(node_id).cloned()
    }

    pub fn set_current_node(&self, node_id: Option<&str>) {
        self.state.lock().unwrap().current_node = node_id.map(String::from);
    }

    pub fn current_node(&self) -> Option<String> {
        self.state.lock().unwrap().current_node.clone()
    }

    /// Seed completion state from a loaded checkpoint.
    pub fn seed_progress(&self, completed: Vec<String>, outcomes: IndexMap<String, Outcome>) {
        let mut state = self.state.lock().unwrap();
        state.completed = completed;
        state.outcomes = outcomes;
    }

    /// Derive a child run for a sub-pipeline: a fresh run id over the
    /// child source, a child cancellation token, and a context seeded with
    /// the forwarded keys.
    pub async fn child(&self, child_source: &str, forward_keys: &[String]) -> RunContext {
        let child = RunContext {
            inner: Arc::new(RunImmutable {
                run_id: Ulid::new(),
                started_at: Utc::now(),
                source_hash: hash_source(child_source),
                source: child_source.to_string(),
            }),
            state: Arc::new(Mutex::new(RunState::default())),
            context: Context::new(),
            cancel: self.cancel.child_token(),
        };
        for key in forward_keys {
            if let Some(value) = self.context.get(key).await {
                child.context.set(key.clone(), value).await;
            }
        }
        child
    }
}

fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
