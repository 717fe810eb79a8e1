//! Command validation and the state reducer.
//!
//! [`handle_command`] turns a command into event payloads or a typed error
//! without touching state. [`apply`] folds an event into the state; it is
//! total, so replay can never fail, and it is where undo entries are
//! pushed, so replaying a log reconstructs the undo stack exactly.

use ulid::Ulid;

use crate::command::{Command, SpecError};
use crate::event::{EventPayload, SpecEvent};
use crate::types::{Card, MessageKind, SpecCore, SpecState, TranscriptMessage, UndoEntry, UserQuestion};

/// Validate a command against current state and produce its event payloads.
pub fn handle_command(state: &SpecState, cmd: Command) -> Result<Vec<EventPayload>, SpecError> {
    match cmd {
        Command::CreateSpec {
            title,
            one_liner,
            goal,
        } => {
            if state.core.is_some() {
                return Err(SpecError::SpecAlreadyCreated);
            }
            Ok(vec![EventPayload::SpecCreated {
                title,
                one_liner,
                goal,
                created_at: chrono::Utc::now(),
            }])
        }

        Command::UpdateSpecCore {
            description,
            constraints,
            success_criteria,
            risks,
            notes,
        } => {
            if state.core.is_none() {
                return Err(SpecError::SpecNotCreated);
            }
            Ok(vec![EventPayload::SpecCoreUpdated {
                description,
                constraints,
                success_criteria,
                risks,
                notes,
                updated_at: chrono::Utc::now(),
            }])
        }

        Command::CreateCard {
            card_type,
            title,
            body,
            lane,
            created_by,
        } => {
            if state.core.is_none() {
                return Err(SpecError::SpecNotCreated);
            }
            let lane = lane.unwrap_or_else(|| "Ideas".to_string());
            if !state.lanes.contains(&lane) {
                return Err(SpecError::UnknownLane(lane));
            }
            let order = next_order(state, &lane);
            let now = chrono::Utc::now();
            Ok(vec![EventPayload::CardCreated {
                card: Card {
                    card_id: Ulid::new(),
                    card_type,
                    title,
                    body,
                    lane,
                    order,
                    refs: Vec::new(),
                    created_at: now,
                    created_by: created_by.clone(),
                    updated_at: now,
                    updated_by: created_by,
                },
            }])
        }

        Command::UpdateCard {
            card_id,
            title,
            body,
            updated_by,
        } => {
            if !state.cards.contains_key(&card_id) {
                return Err(SpecError::CardNotFound(card_id));
            }
            Ok(vec![EventPayload::CardUpdated {
                card_id,
                title,
                body,
                updated_at: chrono::Utc::now(),
                updated_by,
            }])
        }

        Command::MoveCard {
            card_id,
            lane,
            order,
            updated_by,
        } => {
            if !state.cards.contains_key(&card_id) {
                return Err(SpecError::CardNotFound(card_id));
            }
            if !state.lanes.contains(&lane) {
                return Err(SpecError::UnknownLane(lane));
            }
            let order = order.unwrap_or_else(|| next_order(state, &lane));
            Ok(vec![EventPayload::CardMoved {
                card_id,
                lane,
                order,
                updated_at: chrono::Utc::now(),
                updated_by,
            }])
        }

        Command::DeleteCard { card_id } => {
            if !state.cards.contains_key(&card_id) {
                return Err(SpecError::CardNotFound(card_id));
            }
            Ok(vec![EventPayload::CardDeleted { card_id }])
        }

        Command::AppendTranscript { sender, content } => {
            Ok(vec![EventPayload::TranscriptAppended {
                message: TranscriptMessage {
                    message_id: Ulid::new(),
                    sender,
                    content,
                    kind: MessageKind::Chat,
                    timestamp: chrono::Utc::now(),
                },
            }])
        }

        Command::AskQuestion { prompt, kind } => {
            if state.pending_question.is_some() {
                return Err(SpecError::QuestionAlreadyPending);
            }
            Ok(vec![EventPayload::QuestionAsked {
                question: UserQuestion {
                    question_id: Ulid::new(),
                    prompt,
                    kind,
                },
            }])
        }

        Command::AnswerQuestion {
            question_id,
            answer,
        } => match &state.pending_question {
            None => Err(SpecError::NoQuestionPending),
            Some(pending) if pending.question_id != question_id => {
                Err(SpecError::QuestionIdMismatch {
                    pending: pending.question_id,
                    answered: question_id,
                })
            }
            Some(_) => Ok(vec![EventPayload::QuestionAnswered {
                question_id,
                answer,
            }]),
        },

        Command::AgentStepStarted { step } => Ok(vec![EventPayload::AgentStepStarted {
            step,
            message_id: Ulid::new(),
            timestamp: chrono::Utc::now(),
        }]),

        Command::AgentStepFinished { step } => Ok(vec![EventPayload::AgentStepFinished {
            step,
            message_id: Ulid::new(),
            timestamp: chrono::Utc::now(),
        }]),

        Command::Undo => match state.undo_stack.last() {
            None => Err(SpecError::NothingToUndo),
            Some(entry) => Ok(vec![EventPayload::UndoApplied {
                undone_event_id: entry.event_id,
                inverse_payloads: entry.inverse_payloads.clone(),
            }]),
        },
    }
}

fn next_order(state: &SpecState, lane: &str) -> f64 {
    state
        .cards
        .values()
        .filter(|c| c.lane == lane)
        .map(|c| c.order)
        .fold(0.0, f64::max)
        + 1.0
}

/// Fold one event into the state. Total: unknown references are ignored
/// rather than failed, keeping replay robust.
pub fn apply(state: &mut SpecState, event: &SpecEvent) {
    apply_payload(state, &event.payload, event.spec_id, event.event_id, true);
    state.last_event_id = event.event_id;
}

fn apply_payload(
    state: &mut SpecState,
    payload: &EventPayload,
    spec_id: Ulid,
    event_id: u64,
    track_undo: bool,
) {
    match payload {
        EventPayload::SpecCreated {
            title,
            one_liner,
            goal,
            created_at,
        } => {
            state.core = Some(SpecCore {
                spec_id,
                title: title.clone(),
                one_liner: one_liner.clone(),
                goal: goal.clone(),
                description: None,
                constraints: None,
                success_criteria: None,
                risks: None,
                notes: None,
                created_at: *created_at,
                updated_at: *created_at,
            });
        }

        EventPayload::SpecCoreUpdated {
            description,
            constraints,
            success_criteria,
            risks,
            notes,
            updated_at,
        } => {
            if let Some(core) = state.core.as_mut() {
                description.clone().apply_to(&mut core.description);
                constraints.clone().apply_to(&mut core.constraints);
                success_criteria
                    .clone()
                    .apply_to(&mut core.success_criteria);
                risks.clone().apply_to(&mut core.risks);
                notes.clone().apply_to(&mut core.notes);
                core.updated_at = *updated_at;
            }
        }

        EventPayload::CardCreated { card } => {
            if track_undo {
                state.undo_stack.push(UndoEntry {
                    event_id,
                    inverse_payloads: vec![EventPayload::CardDeleted {
                        card_id: card.card_id,
                    }],
                });
            }
            state.cards.insert(card.card_id, card.clone());
        }

        EventPayload::CardUpdated {
            card_id,
            title,
            body,
            updated_at,
            updated_by,
        } => {
            let Some(card) = state.cards.get(card_id).cloned() else {
                return;
            };
            if track_undo {
                state.undo_stack.push(UndoEntry {
                    event_id,
                    inverse_payloads: vec![EventPayload::CardUpdated {
                        card_id: *card_id,
                        title: title.as_ref().map(|_| card.title.clone()),
                        body: body.inverse_of(&card.body),
                        updated_at: card.updated_at,
                        updated_by: card.updated_by.clone(),
                    }],
                });
            }
            let card = state.cards.get_mut(card_id).unwrap();
            if let Some(title) = title {
                card.title = title.clone();
            }
            body.clone().apply_to(&mut card.body);
            card.updated_at = *updated_at;
            card.updated_by = updated_by.clone();
        }

        EventPayload::CardMoved {
            card_id,
            lane,
            order,
            updated_at,
            updated_by,
        } => {
            let Some(card) = state.cards.get(card_id).cloned() else {
                return;
            };
            if track_undo {
                state.undo_stack.push(UndoEntry {
                    event_id,
                    inverse_payloads: vec![EventPayload::CardMoved {
                        card_id: *card_id,
                        lane: card.lane.clone(),
                        order: card.order,
                        updated_at: card.updated_at,
                        updated_by: card.updated_by.clone(),
                    }],
                });
            }
            let card = state.cards.get_mut(card_id).unwrap();
            card.lane = lane.clone();
            card.order = *order;
            card.updated_at = *updated_at;
            card.updated_by = updated_by.clone();
        }

        EventPayload::CardDeleted { card_id } => {
            let Some(card) = state.cards.get(card_id).cloned() else {
                return;
            };
            if track_undo {
                state.undo_stack.push(UndoEntry {
                    event_id,
                    inverse_payloads: vec![EventPayload::CardCreated { card }],
                });
            }
            state.cards.remove(card_id);
        }

        EventPayload::TranscriptAppended { message } => {
            state.transcript.push(message.clone());
        }

        EventPayload::QuestionAsked { question } => {
            state.pending_question = Some(question.clone());
        }

        EventPayload::QuestionAnswered { question_id, .. } => {
            if state
                .pending_question
                .as_ref()
                .is_some_and(|q| q.question_id == *question_id)
            {
                state.pending_question = None;
            }
        }

        EventPayload::AgentStepStarted {
            step,
            message_id,
            timestamp,
        } => {
            state.transcript.push(TranscriptMessage {
                message_id: *message_id,
                sender: "agent".to_string(),
                content: step.clone(),
                kind: MessageKind::StepStarted,
                timestamp: *timestamp,
            });
        }

        EventPayload::AgentStepFinished {
            step,
            message_id,
            timestamp,
        } => {
            state.transcript.push(TranscriptMessage {
                message_id: *message_id,
                sender: "agent".to_string(),
                content: step.clone(),
                kind: MessageKind::StepFinished,
                timestamp: *timestamp,
            });
        }

        EventPayload::UndoApplied {
            inverse_payloads, ..
        } => {
            state.undo_stack.pop();
            for inverse in inverse_payloads {
                apply_payload(state, inverse, spec_id, event_id, false);
            }
        }

        EventPayload::SnapshotWritten { .. } => {}
    }
}
