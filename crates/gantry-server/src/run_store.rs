//! Durable per-run state records.
//!
//! Each run keeps `<data_dir>/runs/<run_id>/state.json`, rewritten
//! atomically on every status transition so a restart can list and
//! inspect past and in-flight runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use gantry_pipeline::{write_atomic, PipelineStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_file: Option<String>,
    pub status: PipelineStatus,
    pub source: String,
    pub source_hash: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct RunStateStore {
    runs_dir: PathBuf,
}

impl RunStateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: data_dir.into().join("runs"),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    /// Persist a record atomically.
    pub fn save(&self, record: &RunRecord) -> gantry_types::Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.state_path(&record.id), &json)
    }

    pub fn load(&self, run_id: &str) -> gantry_types::Result<Option<RunRecord>> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Load every persisted run, most recent first by run id (ULIDs sort
    /// chronologically).
    pub fn load_all(&self) -> gantry_types::Result<Vec<RunRecord>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&run_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run = %run_id, error = %e, "Skipping unreadable run record");
                }
            }
        }
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    /// Remove a run's directory entirely. Operator-only.
    pub fn delete(&self, run_id: &str) -> gantry_types::Result<()> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }
}
