//! Append-only JSONL event log with open-time repair.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::event::SpecEvent;

use super::StoreError;

/// Append events as JSON lines and fsync once for the batch.
pub fn append_events(path: &Path, events: &[SpecEvent]) -> Result<(), StoreError> {
    if events.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for event in events {
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_all()?;
    Ok(())
}

/// Read and parse the whole log. Call [`repair`] first when the file may
/// hold a torn tail from a crash.
pub fn read_events(path: &Path) -> Result<Vec<SpecEvent>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}

#[derive(Debug, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Events surviving the repair.
    pub kept: usize,
    /// Whether a torn tail was cut off.
    pub truncated: bool,
}

/// Truncate the log at the first unparsable line.
///
/// The valid prefix is rewritten through a temp file and renamed into
/// place, with the parent directory fsynced, so a crash during repair
/// cannot make things worse.
pub fn repair(path: &Path) -> Result<RepairOutcome, StoreError> {
    if !path.exists() {
        return Ok(RepairOutcome {
            kept: 0,
            truncated: false,
        });
    }

    let content = std::fs::read_to_string(path)?;
    let mut valid_lines: Vec<&str> = Vec::new();
    let mut truncated = false;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SpecEvent>(line) {
            Ok(_) => valid_lines.push(line),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    kept = valid_lines.len(),
                    error = %e,
                    "Repairing event log: truncating at first unparsable line"
                );
                truncated = true;
                break;
            }
        }
    }

    if truncated {
        let mut repaired = valid_lines.join("\n");
        if !repaired.is_empty() {
            repaired.push('\n');
        }
        gantry_pipeline::write_atomic(path, repaired.as_bytes())?;
    }

    Ok(RepairOutcome {
        kept: valid_lines.len(),
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use ulid::Ulid;

    fn event(id: u64) -> SpecEvent {
        SpecEvent {
            event_id: id,
            spec_id: Ulid::from_parts(1, 1),
            timestamp: chrono::Utc::now(),
            payload: EventPayload::AgentStepStarted {
                step: format!("step {id}"),
                message_id: Ulid::new(),
                timestamp: chrono::Utc::now(),
            },
        }
    }

    #[test]
    fn append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        append_events(&path, &[event(1), event(2)]).unwrap();
        append_events(&path, &[event(3)]).unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join("nope.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn repair_clean_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_events(&path, &[event(1), event(2)]).unwrap();

        let before = std::fs::read_to_string(&path).unwrap();
        let outcome = repair(&path).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome {
                kept: 2,
                truncated: false
            }
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn repair_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_events(&path, &[event(1), event(2)]).unwrap();

        // Simulate a crash mid-append: a partial final line.
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"event_id\":3,\"spec_id\":\"trunc");
        std::fs::write(&path, &content).unwrap();

        let outcome = repair(&path).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome {
                kept: 2,
                truncated: true
            }
        );

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn repair_garbage_midfile_keeps_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_events(&path, &[event(1)]).unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("not json at all\n");
        std::fs::write(&path, &content).unwrap();
        append_events(&path, &[event(2)]).unwrap();

        // Everything after the first bad line goes, even if parsable.
        let outcome = repair(&path).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome {
                kept: 1,
                truncated: true
            }
        );
        assert_eq!(read_events(&path).unwrap().len(), 1);
    }

    #[test]
    fn repair_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = repair(&dir.path().join("absent.jsonl")).unwrap();
        assert_eq!(
            outcome,
            RepairOutcome {
                kept: 0,
                truncated: false
            }
        );
    }
}
