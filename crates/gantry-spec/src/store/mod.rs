//! Durable spec storage.
//!
//! Per-spec directory layout:
//! `<home>/specs/<ulid>/{events.jsonl, index.db, snapshots/state_<n>.json}`.
//!
//! The JSONL event log is the source of truth and the only fsynced write
//! in the hot path. Snapshots bound replay time. The SQLite index is a
//! queryable cache, always rebuildable from the log.

mod index;
mod log;
mod recovery;
mod snapshot;

pub use index::IndexedCard;
pub use recovery::recover;

use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::event::SpecEvent;
use crate::types::SpecState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl From<gantry_types::GantryError> for StoreError {
    fn from(e: gantry_types::GantryError) -> Self {
        match e {
            gantry_types::GantryError::Io(io) => StoreError::Io(io),
            gantry_types::GantryError::Json(json) => StoreError::Json(json),
            other => StoreError::Other(other.to_string()),
        }
    }
}

pub struct SpecStore {
    dir: PathBuf,
    spec_id: Ulid,
    pool: sqlx::SqlitePool,
}

impl SpecStore {
    /// Open (creating if needed) the store directory and its index.
    pub async fn open(dir: impl Into<PathBuf>, spec_id: Ulid) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("snapshots"))?;
        std::fs::create_dir_all(dir.join("exports"))?;
        let pool = index::open(&dir.join("index.db")).await?;
        Ok(Self { dir, spec_id, pool })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn spec_id(&self) -> Ulid {
        self.spec_id
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    /// Append events to the log, fsyncing before returning.
    pub async fn append(&mut self, events: &[SpecEvent]) -> Result<(), StoreError> {
        log::append_events(&self.events_path(), events)?;
        Ok(())
    }

    /// Fold events into the SQLite index. Failures leave the index stale;
    /// recovery detects that and rebuilds.
    pub async fn index_events(&self, events: &[SpecEvent]) -> Result<(), StoreError> {
        for event in events {
            index::apply_event(&self.pool, event).await?;
        }
        Ok(())
    }

    /// Write an atomic snapshot named for the state's last event id.
    pub async fn write_snapshot(&self, state: &SpecState) -> Result<(), StoreError> {
        snapshot::write_snapshot(&self.dir, state)?;
        Ok(())
    }

    /// Read the full event log (after repair).
    pub fn read_events(&self) -> Result<Vec<SpecEvent>, StoreError> {
        log::read_events(&self.events_path())
    }

    /// Cards currently in the index, ordered by lane and position.
    pub async fn indexed_cards(&self) -> Result<Vec<index::IndexedCard>, StoreError> {
        index::cards_for_spec(&self.pool, self.spec_id).await
    }

    pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}
