//! Periodic full-state snapshots.
//!
//! Snapshots live in `snapshots/state_<n>.json` where `n` is the state's
//! `last_event_id` at write time; the latest snapshot is the largest `n`.

use std::path::Path;

use crate::types::SpecState;

use super::StoreError;

pub fn write_snapshot(dir: &Path, state: &SpecState) -> Result<(), StoreError> {
    let path = dir
        .join("snapshots")
        .join(format!("state_{}.json", state.last_event_id));
    let json = serde_json::to_vec_pretty(state)?;
    gantry_pipeline::write_atomic(&path, &json)?;
    tracing::debug!(path = %path.display(), "Snapshot written");
    Ok(())
}

/// Load the snapshot with the highest event id, if any.
pub fn load_latest(dir: &Path) -> Result<Option<(u64, SpecState)>, StoreError> {
    let snapshots = dir.join("snapshots");
    if !snapshots.exists() {
        return Ok(None);
    }

    let mut latest: Option<(u64, std::path::PathBuf)> = None;
    for entry in std::fs::read_dir(&snapshots)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(n) = name
            .strip_prefix("state_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| n > *best) {
            latest = Some((n, entry.path()));
        }
    }

    match latest {
        None => Ok(None),
        Some((n, path)) => {
            let json = std::fs::read_to_string(path)?;
            let state: SpecState = serde_json::from_str(&json)?;
            Ok(Some((n, state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(event_id: u64) -> SpecState {
        let mut state = SpecState::new();
        state.last_event_id = event_id;
        state
    }

    #[test]
    fn write_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        write_snapshot(dir.path(), &state_at(5)).unwrap();
        write_snapshot(dir.path(), &state_at(40)).unwrap();
        write_snapshot(dir.path(), &state_at(12)).unwrap();

        let (n, state) = load_latest(dir.path()).unwrap().unwrap();
        assert_eq!(n, 40);
        assert_eq!(state.last_event_id, 40);
    }

    #[test]
    fn load_latest_with_no_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_latest(dir.path()).unwrap().is_none());

        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();
        assert!(load_latest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();
        std::fs::write(dir.path().join("snapshots/readme.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("snapshots/state_bogus.json"), "{}").unwrap();

        write_snapshot(dir.path(), &state_at(3)).unwrap();
        let (n, _) = load_latest(dir.path()).unwrap().unwrap();
        assert_eq!(n, 3);
    }
}
