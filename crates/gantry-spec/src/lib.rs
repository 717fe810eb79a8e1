//! Event-sourced specification subsystem.
//!
//! A single-writer [`SpecActor`] owns a kanban-style [`SpecState`]:
//! commands become events, events fold into state and fan out to
//! subscribers, and an undo log inverts card mutations. The durable
//! [`store`] keeps an fsynced JSONL event log, periodic snapshots, and a
//! rebuildable SQLite index, with crash recovery stitching them together.

pub mod actor;
pub mod command;
pub mod event;
pub mod reducer;
pub mod store;
pub mod types;

pub use actor::{SpecActor, SUBSCRIBER_BUFFER};
pub use command::{Command, SpecError};
pub use event::{EventPayload, SpecEvent};
pub use reducer::{apply, handle_command};
pub use store::{recover, SpecStore, StoreError};
pub use types::{
    default_lanes, Card, MessageKind, OptionalField, QuestionKind, SpecCore, SpecState,
    TranscriptMessage, UndoEntry, UserQuestion,
};

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    // Durable actor end to end: commands append to the log, restart
    // recovers the same state.
    #[tokio::test]
    async fn actor_with_store_survives_restart() {
        let parent = tempfile::tempdir().unwrap();
        let spec_id = Ulid::new();
        let dir = parent.path().join(spec_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();

        {
            let (state, store) = recover(&dir, spec_id).await.unwrap();
            let actor = SpecActor::with_store(spec_id, state, store);
            actor
                .send_command(Command::CreateSpec {
                    title: "X".into(),
                    one_liner: "Y".into(),
                    goal: "Z".into(),
                })
                .await
                .unwrap();
            actor
                .send_command(Command::CreateCard {
                    card_type: "idea".into(),
                    title: "C".into(),
                    body: Some("details".into()),
                    lane: None,
                    created_by: "agent".into(),
                })
                .await
                .unwrap();
        }

        // "Restart": recover from disk and check everything came back.
        let (state, store) = recover(&dir, spec_id).await.unwrap();
        assert_eq!(state.last_event_id, 2);
        assert_eq!(state.cards.len(), 1);
        assert_eq!(state.core.as_ref().unwrap().title, "X");
        assert_eq!(state.undo_stack.len(), 1);

        let indexed = store.indexed_cards().await.unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].title, "C");

        // And the recovered actor keeps working, ids continuing upward.
        let actor = SpecActor::with_store(spec_id, state, store);
        let events = actor.send_command(Command::Undo).await.unwrap();
        assert_eq!(events[0].event_id, 3);
        assert_eq!(actor.read_state(|s| s.cards.len()).await, 0);
    }
}
