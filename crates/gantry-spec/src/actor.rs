//! The single-writer spec actor.
//!
//! One task owns all mutation: commands arrive on a bounded mpsc channel
//! with per-command oneshot replies, are validated and converted to
//! events, durably appended (when a store is attached), applied to the
//! in-memory state under the write lock, and broadcast to subscribers on
//! a bounded, lossy channel. Readers take the state lock read-side only.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::command::{Command, SpecError};
use crate::event::SpecEvent;
use crate::reducer::{apply, handle_command};
use crate::store::SpecStore;
use crate::types::SpecState;

/// Per-subscriber event buffer; slow subscribers drop events rather than
/// stalling the writer.
pub const SUBSCRIBER_BUFFER: usize = 4096;

const COMMAND_BUFFER: usize = 64;

/// How many events may accumulate before the actor writes a snapshot.
const SNAPSHOT_INTERVAL: u64 = 100;

struct CommandEnvelope {
    cmd: Command,
    reply: oneshot::Sender<Result<Vec<SpecEvent>, SpecError>>,
}

#[derive(Clone)]
pub struct SpecActor {
    spec_id: Ulid,
    tx: mpsc::Sender<CommandEnvelope>,
    state: Arc<RwLock<SpecState>>,
    events: broadcast::Sender<SpecEvent>,
}

impl SpecActor {
    /// Spawn an actor with no durable store. State lives only in memory.
    pub fn in_memory(spec_id: Ulid) -> Self {
        Self::spawn(spec_id, SpecState::new(), None)
    }

    /// Spawn an actor over recovered state backed by a durable store.
    pub fn with_store(spec_id: Ulid, state: SpecState, store: SpecStore) -> Self {
        Self::spawn(spec_id, state, Some(store))
    }

    fn spawn(spec_id: Ulid, initial: SpecState, store: Option<SpecStore>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let state = Arc::new(RwLock::new(initial));

        let actor = Self {
            spec_id,
            tx,
            state: Arc::clone(&state),
            events: events.clone(),
        };

        tokio::spawn(writer_loop(spec_id, rx, state, events, store));
        actor
    }

    pub fn spec_id(&self) -> Ulid {
        self.spec_id
    }

    /// Validate and apply a command, returning the emitted events.
    pub async fn send_command(&self, cmd: Command) -> Result<Vec<SpecEvent>, SpecError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CommandEnvelope { cmd, reply })
            .await
            .map_err(|_| SpecError::ActorGone)?;
        rx.await.map_err(|_| SpecError::ActorGone)?
    }

    /// Subscribe to the event stream. The buffer is bounded; falling more
    /// than [`SUBSCRIBER_BUFFER`] events behind loses the overflow.
    pub fn subscribe(&self) -> broadcast::Receiver<SpecEvent> {
        self.events.subscribe()
    }

    /// Run a read-only callback under the state read lock.
    pub async fn read_state<R>(&self, f: impl FnOnce(&SpecState) -> R) -> R {
        let guard = self.state.read().await;
        f(&guard)
    }
}

async fn writer_loop(
    spec_id: Ulid,
    mut rx: mpsc::Receiver<CommandEnvelope>,
    state: Arc<RwLock<SpecState>>,
    events_tx: broadcast::Sender<SpecEvent>,
    mut store: Option<SpecStore>,
) {
    let mut last_snapshot_at = {
        let guard = state.read().await;
        guard.last_event_id
    };

    while let Some(CommandEnvelope { cmd, reply }) = rx.recv().await {
        let result = process_command(spec_id, cmd, &state, &events_tx, store.as_mut()).await;

        // Periodic snapshots keep recovery replay short.
        if let (Ok(_), Some(store)) = (&result, store.as_mut()) {
            let guard = state.read().await;
            if guard.last_event_id.saturating_sub(last_snapshot_at) >= SNAPSHOT_INTERVAL {
                match store.write_snapshot(&guard).await {
                    Ok(()) => last_snapshot_at = guard.last_event_id,
                    Err(e) => {
                        tracing::error!(spec = %spec_id, error = %e, "Snapshot write failed");
                    }
                }
            }
        }

        let _ = reply.send(result);
    }
    tracing::debug!(spec = %spec_id, "Spec actor stopped");
}

async fn process_command(
    spec_id: Ulid,
    cmd: Command,
    state: &Arc<RwLock<SpecState>>,
    events_tx: &broadcast::Sender<SpecEvent>,
    store: Option<&mut SpecStore>,
) -> Result<Vec<SpecEvent>, SpecError> {
    // Validate against a read snapshot; this task is the only writer, so
    // nothing can change state between validation and application.
    let payloads = {
        let guard = state.read().await;
        handle_command(&guard, cmd)?
    };

    let first_id = {
        let guard = state.read().await;
        guard.last_event_id + 1
    };
    let events: Vec<SpecEvent> = payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| SpecEvent {
            event_id: first_id + i as u64,
            spec_id,
            timestamp: chrono::Utc::now(),
            payload,
        })
        .collect();

    // Durability first: a failed append returns the error to the caller
    // and leaves state untouched.
    if let Some(store) = store {
        store
            .append(&events)
            .await
            .map_err(|e| SpecError::Storage(e.to_string()))?;
        if let Err(e) = store.index_events(&events).await {
            // The index is a rebuildable cache; log and continue.
            tracing::warn!(spec = %spec_id, error = %e, "Index update failed");
        }
    }

    {
        let mut guard = state.write().await;
        for event in &events {
            apply(&mut guard, event);
        }
    }

    for event in &events {
        // Send fails only with zero subscribers, which is fine.
        let _ = events_tx.send(event.clone());
    }

    Ok(events)
}
