//! Spec events: the envelope and the tagged payload union.
//!
//! Wire format is newline-delimited JSON, one event per line:
//! `{"event_id":1,"spec_id":"<ulid>","timestamp":"<rfc3339>","payload":{"type":"SpecCreated",...}}`

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::{Card, OptionalField, TranscriptMessage, UserQuestion};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecEvent {
    pub event_id: u64,
    pub spec_id: Ulid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    SpecCreated {
        title: String,
        one_liner: String,
        goal: String,
        created_at: chrono::DateTime<chrono::Utc>,
    },
    SpecCoreUpdated {
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        description: OptionalField<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        constraints: OptionalField<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        success_criteria: OptionalField<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        risks: OptionalField<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        notes: OptionalField<String>,
        updated_at: chrono::DateTime<chrono::Utc>,
    },
    CardCreated {
        card: Card,
    },
    CardUpdated {
        card_id: Ulid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        body: OptionalField<String>,
        updated_at: chrono::DateTime<chrono::Utc>,
        updated_by: String,
    },
    CardMoved {
        card_id: Ulid,
        lane: String,
        order: f64,
        updated_at: chrono::DateTime<chrono::Utc>,
        updated_by: String,
    },
    CardDeleted {
        card_id: Ulid,
    },
    TranscriptAppended {
        message: TranscriptMessage,
    },
    QuestionAsked {
        question: UserQuestion,
    },
    QuestionAnswered {
        question_id: Ulid,
        answer: serde_json::Value,
    },
    AgentStepStarted {
        step: String,
        message_id: Ulid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    AgentStepFinished {
        step: String,
        message_id: Ulid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    UndoApplied {
        undone_event_id: u64,
        inverse_payloads: Vec<EventPayload>,
    },
    SnapshotWritten {
        snapshot_event_id: u64,
    },
}

impl EventPayload {
    /// The wire name of the variant (its `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SpecCreated { .. } => "SpecCreated",
            EventPayload::SpecCoreUpdated { .. } => "SpecCoreUpdated",
            EventPayload::CardCreated { .. } => "CardCreated",
            EventPayload::CardUpdated { .. } => "CardUpdated",
            EventPayload::CardMoved { .. } => "CardMoved",
            EventPayload::CardDeleted { .. } => "CardDeleted",
            EventPayload::TranscriptAppended { .. } => "TranscriptAppended",
            EventPayload::QuestionAsked { .. } => "QuestionAsked",
            EventPayload::QuestionAnswered { .. } => "QuestionAnswered",
            EventPayload::AgentStepStarted { .. } => "AgentStepStarted",
            EventPayload::AgentStepFinished { .. } => "AgentStepFinished",
            EventPayload::UndoApplied { .. } => "UndoApplied",
            EventPayload::SnapshotWritten { .. } => "SnapshotWritten",
        }
    }
}
