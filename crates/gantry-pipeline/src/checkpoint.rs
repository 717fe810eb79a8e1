//! Checkpoint persistence and crash recovery for pipeline runs.
//!
//! After each node settles the engine writes a [`CheckpointRecord`] to
//! `<checkpoint_dir>/<run_id>/checkpoint.json`. Writes are atomic: the
//! record lands in a temp file that is fsynced and renamed into place,
//! followed by an fsync of the parent directory. On restart,
//! [`load_checkpoint`] hands the engine enough state to skip completed
//! nodes, provided the stored source hash still matches.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use gantry_types::Outcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub source_hash: String,
    pub completed_nodes: Vec<String>,
    pub outcomes: IndexMap<String, Outcome>,
    pub context: HashMap<String, serde_json::Value>,
    pub last_node_id: String,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target, fsync the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> gantry_types::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| gantry_types::GantryError::Other("path has no parent".into()))?;
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    // Persist the rename itself. Directory fsync is a unix concept; other
    // platforms settle for the file fsync above.
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn checkpoint_path(checkpoint_dir: &Path, run_id: &str) -> PathBuf {
    checkpoint_dir.join(run_id).join("checkpoint.json")
}

/// Persist a checkpoint for `run_id` under `checkpoint_dir`.
pub fn save_checkpoint(
    checkpoint_dir: &Path,
    record: &CheckpointRecord,
) -> gantry_types::Result<PathBuf> {
    let path = checkpoint_path(checkpoint_dir, &record.run_id);
    let json = serde_json::to_vec_pretty(record)?;
    write_atomic(&path, &json)?;
    tracing::debug!(path = %path.display(), node = %record.last_node_id, "Checkpoint saved");
    Ok(path)
}

/// Load the checkpoint for `run_id`, or `None` when no checkpoint exists.
pub fn load_checkpoint(
    checkpoint_dir: &Path,
    run_id: &str,
) -> gantry_types::Result<Option<CheckpointRecord>> {
    let path = checkpoint_path(checkpoint_dir, run_id);
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&json)?))
}

/// Remove the checkpoint directory for a run.
pub fn clear_checkpoint(checkpoint_dir: &Path, run_id: &str) -> gantry_types::Result<()> {
    let dir = checkpoint_dir.join(run_id);
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(())
}
