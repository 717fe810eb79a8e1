//! Shared types, errors, context, and outcome for the Gantry pipeline engine.
//!
//! This crate provides the foundational types used across all other Gantry crates:
//! - `GantryError` — unified error taxonomy
//! - `Context` — thread-safe key-value store for run state
//! - `Outcome` — result of executing a node handler

use serde::{Deserialize, Serialize};

/// Unified error type for all Gantry subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    // === Parser Errors ===
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    // === Pipeline Errors ===
    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Goal gate unsatisfied: node '{node}' did not reach SUCCESS")]
    GoalGateUnsatisfied { node: String },

    #[error("Max retries exhausted for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: usize },

    #[error("Cannot resume run '{run_id}': checkpoint source hash does not match submitted source")]
    SourceHashMismatch { run_id: String },

    // === Backend Errors ===
    #[error("Backend error on node '{node}': {message}")]
    BackendError {
        node: String,
        message: String,
        retryable: bool,
    },

    #[error("Interviewer disconnected while waiting on node '{node}'")]
    InterviewerDisconnected { node: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl GantryError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GantryError::NodeTimeout { .. } | GantryError::BackendError { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GantryError::ValidationError(_)
                | GantryError::ParseError { .. }
                | GantryError::Cancelled { .. }
                | GantryError::InterviewerDisconnected { .. }
                | GantryError::SourceHashMismatch { .. }
        )
    }

    /// Maps the error to an HTTP status code for server mode.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            GantryError::ParseError { .. } => Some(400),
            GantryError::ValidationError(_) => Some(422),
            GantryError::NodeTimeout { .. } => Some(504),
            GantryError::Cancelled { .. } => Some(409),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, GantryError>`.
pub type Result<T> = std::result::Result<T, GantryError>;

// ---------------------------------------------------------------------------
// Context — thread-safe key-value store for run state
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe key-value store shared across pipeline nodes.
///
/// Cloning a `Context` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](Context::clone_isolated) to get a deep copy for
/// sub-pipeline isolation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<HashMap<String, serde_json::Value>>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    /// Create a context seeded with the given values.
    pub fn from_map(values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(values)),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.get(key).cloned()
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.inner
            .read()
            .await
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    /// Resolve a key to the string form used by the condition evaluator.
    /// Absent keys resolve to the empty string; non-string JSON values are
    /// rendered without quotes.
    pub async fn resolve(&self, key: &str) -> String {
        match self.inner.read().await.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.clone()
    }

    /// Deep copy that is fully independent of the original context.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        let mut guard = self.inner.write().await;
        guard.extend(updates);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StageStatus — outcome status of a pipeline node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Fail,
    Skipped,
    Cancelled,
    Retrying,
}

impl StageStatus {
    /// The lowercase string exposed to edge conditions as `outcome`.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Fail => "fail",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
            StageStatus::Retrying => "retrying",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a node handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_paths: Vec<String>,
    /// Values exposed to the condition evaluator and recorded with the run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
    /// Edge label preferred by the handler (e.g. the choice a human made).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Outcome {
    /// Create a successful outcome with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            message: Some(message.into()),
            artifact_paths: Vec::new(),
            data: HashMap::new(),
            preferred_label: None,
            duration_ms: None,
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            message: Some(reason.into()),
            artifact_paths: Vec::new(),
            data: HashMap::new(),
            preferred_label: None,
            duration_ms: None,
        }
    }

    /// Create an outcome with the given status and no message.
    pub fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            message: None,
            artifact_paths: Vec::new(),
            data: HashMap::new(),
            preferred_label: None,
            duration_ms: None,
        }
    }

    /// Attach a data value, consuming and returning the outcome.
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attach a preferred edge label, consuming and returning the outcome.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.preferred_label = Some(label.into());
        self
    }

    /// Resolve a data key to the string form used by the condition evaluator.
    pub fn resolve(&self, key: &str) -> Option<String> {
        if key == "outcome" {
            return Some(self.status.as_str().to_string());
        }
        match self.data.get(key) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }
}
