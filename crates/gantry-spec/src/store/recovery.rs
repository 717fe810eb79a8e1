//! Crash recovery for a spec directory.
//!
//! Sequence: load the latest snapshot, repair the event log, replay the
//! tail (filtering foreign spec ids), then reconcile the SQLite index by
//! trusting the snapshot when the log is empty and rebuilding otherwise.

use std::path::Path;

use ulid::Ulid;

use crate::reducer::apply;
use crate::types::SpecState;

use super::{index, log, snapshot, SpecStore, StoreError};

/// Recover a spec from its directory, returning the reconstructed state
/// and an opened store ready for the actor.
pub async fn recover(dir: &Path, spec_id: Ulid) -> Result<(SpecState, SpecStore), StoreError> {
    // 1. Latest snapshot, if any.
    let (snapshot_event_id, mut state, had_snapshot) = match snapshot::load_latest(dir)? {
        Some((n, state)) => (n, state, true),
        None => (0, SpecState::new(), false),
    };

    // 2. Repair a possibly torn log.
    let events_path = dir.join("events.jsonl");
    let outcome = log::repair(&events_path)?;
    if outcome.truncated {
        tracing::warn!(spec = %spec_id, kept = outcome.kept, "Event log repaired");
    }

    // 3. Replay events past the snapshot. When the directory name parses
    //    as a ULID, foreign spec ids are skipped so cross-spec
    //    contamination cannot corrupt state.
    let expected_spec = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| Ulid::from_string(n).ok());
    let events = log::read_events(&events_path)?;
    let mut replayed = 0usize;
    for event in &events {
        if let Some(expected) = expected_spec {
            if event.spec_id != expected {
                tracing::warn!(
                    spec = %spec_id,
                    foreign = %event.spec_id,
                    event_id = event.event_id,
                    "Skipping event from foreign spec during replay"
                );
                continue;
            }
        }
        if event.event_id > snapshot_event_id {
            apply(&mut state, event);
            replayed += 1;
        }
    }
    tracing::debug!(spec = %spec_id, replayed, from = snapshot_event_id, "Replay complete");

    // 4. Open the index.
    let store = SpecStore::open(dir, spec_id).await?;
    let index_last = index::last_event_id(store.pool()).await?;

    // 5. Reconcile.
    if index_last == Some(state.last_event_id) && state.last_event_id > 0 {
        // Index is current.
    } else if events.is_empty() && had_snapshot {
        // No events on disk but a snapshot exists: the snapshot is
        // authoritative; bring the index to it.
        index::rebuild(store.pool(), spec_id, &state).await?;
    } else if state.last_event_id > 0 || index_last.is_some() {
        tracing::info!(
            spec = %spec_id,
            index = ?index_last,
            state = state.last_event_id,
            "Index out of date, rebuilding"
        );
        index::rebuild(store.pool(), spec_id, &state).await?;
    }

    Ok((state, store))
}
