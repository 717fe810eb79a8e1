//! Specification data model: core, cards, transcript, questions, state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Default kanban lanes for a fresh specification.
pub fn default_lanes() -> Vec<String> {
    vec!["Ideas".to_string(), "Plan".to_string(), "Spec".to_string()]
}

// ---------------------------------------------------------------------------
// OptionalField — tri-state value for partial updates
// ---------------------------------------------------------------------------

/// Distinguishes "leave unchanged" (absent key), "clear" (explicit null),
/// and "set" (present value) in partial updates.
///
/// Serialization relies on the containing struct using
/// `#[serde(default, skip_serializing_if = "OptionalField::is_absent")]`:
/// absent fields omit the key entirely, `Null` emits a JSON null, and
/// `Present` emits the value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OptionalField<T> {
    #[default]
    Absent,
    Null,
    Present(T),
}

impl<T> OptionalField<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, OptionalField::Absent)
    }

    pub fn as_ref(&self) -> OptionalField<&T> {
        match self {
            OptionalField::Absent => OptionalField::Absent,
            OptionalField::Null => OptionalField::Null,
            OptionalField::Present(v) => OptionalField::Present(v),
        }
    }

    /// Fold into the updated value for a target `Option<T>` field.
    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            OptionalField::Absent => {}
            OptionalField::Null => *target = None,
            OptionalField::Present(v) => *target = Some(v),
        }
    }

    /// The tri-state that would restore `prior` if applied.
    pub fn inverse_of(&self, prior: &Option<T>) -> OptionalField<T>
    where
        T: Clone,
    {
        if self.is_absent() {
            OptionalField::Absent
        } else {
            match prior {
                Some(v) => OptionalField::Present(v.clone()),
                None => OptionalField::Null,
            }
        }
    }
}

impl<T: Serialize> Serialize for OptionalField<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Absent is normally skipped by the container; if it is
            // serialized anyway it degrades to null.
            OptionalField::Absent | OptionalField::Null => serializer.serialize_none(),
            OptionalField::Present(v) => v.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OptionalField<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            None => OptionalField::Null,
            Some(v) => OptionalField::Present(v),
        })
    }
}

// ---------------------------------------------------------------------------
// SpecCore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecCore {
    pub spec_id: Ulid,
    pub title: String,
    pub one_liner: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Card
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub card_id: Ulid,
    pub card_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub lane: String,
    /// Position within the lane; fractional so cards insert between
    /// neighbors without renumbering.
    pub order: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub created_by: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub updated_by: String,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Chat,
    StepStarted,
    StepFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub message_id: Ulid,
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// UserQuestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuestion {
    pub question_id: Ulid,
    pub prompt: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "question_type")]
pub enum QuestionKind {
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
    MultipleChoice {
        choices: Vec<String>,
        allow_multi: bool,
    },
    Freeform {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// SpecState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub event_id: u64,
    pub inverse_payloads: Vec<crate::event::EventPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<SpecCore>,
    /// Cards keyed by ULID; the BTreeMap gives lexicographic (and so
    /// chronological) iteration order.
    #[serde(default)]
    pub cards: BTreeMap<Ulid, Card>,
    #[serde(default)]
    pub transcript: Vec<TranscriptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<UserQuestion>,
    #[serde(default)]
    pub undo_stack: Vec<UndoEntry>,
    pub last_event_id: u64,
    #[serde(default = "default_lanes")]
    pub lanes: Vec<String>,
}

impl SpecState {
    pub fn new() -> Self {
        Self {
            core: None,
            cards: BTreeMap::new(),
            transcript: Vec::new(),
            pending_question: None,
            undo_stack: Vec::new(),
            last_event_id: 0,
            lanes: default_lanes(),
        }
    }

    pub fn cards_in_lane<'a>(&'a self, lane: &'a str) -> impl Iterator<Item = &'a Card> {
        let mut cards: Vec<&Card> = self.cards.values().filter(|c| c.lane == lane).collect();
        cards.sort_by(|a, b| a.order.total_cmp(&b.order));
        cards.into_iter()
    }
}

impl Default for SpecState {
    fn default() -> Self {
        Self::new()
    }
}
