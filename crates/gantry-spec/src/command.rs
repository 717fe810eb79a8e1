//! Commands accepted by the spec actor, and the typed errors they return.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::OptionalField;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    CreateSpec {
        title: String,
        one_liner: String,
        goal: String,
    },
    UpdateSpecCore {
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
    },
    CreateCard {
        card_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lane: Option<String>,
        #[serde(default = "default_actor")]
        created_by: String,
    },
    UpdateCard {
        card_id: Ulid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "OptionalField::is_absent")]
        body: OptionalField<String>,
        #[serde(default = "default_actor")]
        updated_by: String,
    },
    MoveCard {
        card_id: Ulid,
        lane: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<f64>,
        #[serde(default = "default_actor")]
        updated_by: String,
    },
    DeleteCard {
        card_id: Ulid,
    },
    AppendTranscript {
        sender: String,
        content: String,
    },
    AskQuestion {
        prompt: String,
        kind: crate::types::QuestionKind,
    },
    AnswerQuestion {
        question_id: Ulid,
        answer: serde_json::Value,
    },
    AgentStepStarted {
        step: String,
    },
    AgentStepFinished {
        step: String,
    },
    Undo,
}

fn default_actor() -> String {
    "agent".to_string()
}

/// Typed failures returned to the command sender. No event is emitted and
/// no state changes when one of these comes back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("spec has not been created yet")]
    SpecNotCreated,

    #[error("spec already created")]
    SpecAlreadyCreated,

    #[error("card '{0}' not found")]
    CardNotFound(Ulid),

    #[error("a question is already pending")]
    QuestionAlreadyPending,

    #[error("no question is pending")]
    NoQuestionPending,

    #[error("question id mismatch: pending {pending}, answered {answered}")]
    QuestionIdMismatch { pending: Ulid, answered: Ulid },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("unknown lane '{0}'")]
    UnknownLane(String),

    #[error("event log write failed: {0}")]
    Storage(String),

    #[error("spec actor is gone")]
    ActorGone,
}
