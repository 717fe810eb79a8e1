//! Interviewer trait and built-in implementations for human interaction.

use async_trait::async_trait;
use gantry_types::Result;

#[derive(Debug, Clone)]
pub struct Question {
    pub run_id: String,
    pub node_id: String,
    pub prompt: String,
    pub choices: Vec<String>,
    pub default: Option<String>,
    pub timeout: Option<std::time::Duration>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Answer {
    pub choice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub data: std::collections::HashMap<String, serde_json::Value>,
}

impl Answer {
    pub fn choice(choice: impl Into<String>) -> Self {
        Self {
            choice: choice.into(),
            text: None,
            data: std::collections::HashMap::new(),
        }
    }
}

#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Answers every question with its default (or first) choice. Used by
/// non-interactive runs.
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let choice = question
            .default
            .clone()
            .or_else(|| question.choices.first().cloned())
            .unwrap_or_default();
        Ok(Answer::choice(choice))
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Prompts on stdout and reads the answer from stdin.
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        println!("\n{}", question.prompt);
        for (i, choice) in question.choices.iter().enumerate() {
            println!("  [{}] {}", i + 1, choice);
        }
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(gantry_types::GantryError::Io)?;
        let trimmed = input.trim();
        if let Ok(idx) = trimmed.parse::<usize>() {
            if idx > 0 && idx <= question.choices.len() {
                return Ok(Answer::choice(question.choices[idx - 1].clone()));
            }
        }
        Ok(Answer {
            choice: trimmed.to_string(),
            text: Some(trimmed.to_string()),
            data: std::collections::HashMap::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

/// Replays preset answers and records the questions it was asked.
pub struct RecordingInterviewer {
    answers: std::sync::Mutex<Vec<Answer>>,
    questions: std::sync::Mutex<Vec<Question>>,
}

impl RecordingInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        let mut reversed = answers;
        reversed.reverse();
        Self {
            answers: std::sync::Mutex::new(reversed),
            questions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<Question> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Interviewer for RecordingInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        self.questions.lock().unwrap().push(question.clone());
        let answer = self.answers.lock().unwrap().pop().unwrap_or_else(|| {
            Answer::choice(question.choices.first().cloned().unwrap_or_default())
        });
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// ChannelInterviewer
// ---------------------------------------------------------------------------

/// Bridges questions to an external answer source (e.g. an HTTP endpoint).
///
/// `ask` parks the pending question under its run and node ids and waits
/// on a oneshot receiver; whoever holds the other end (the control plane)
/// completes it with [`ChannelInterviewer::answer`]. Dropping the sender
/// surfaces as an interviewer disconnect, which is not retriable.
pub struct ChannelInterviewer {
    pending: std::sync::Mutex<
        std::collections::HashMap<(String, String), tokio::sync::oneshot::Sender<Answer>>,
    >,
}

impl ChannelInterviewer {
    pub fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Complete the pending question for `node_id` within `run_id`.
    /// Returns `false` when nothing is waiting there.
    pub fn answer(&self, run_id: &str, node_id: &str, answer: Answer) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap()
            .remove(&(run_id.to_string(), node_id.to_string()));
        match sender {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// (run id, node id) pairs currently blocked on a human.
    pub fn pending_nodes(&self) -> Vec<(String, String)> {
        self.pending.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for ChannelInterviewer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Interviewer for ChannelInterviewer {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert((question.run_id.clone(), question.node_id.clone()), tx);
        rx.await
            .map_err(|_| gantry_types::GantryError::InterviewerDisconnected {
                node: question.node_id.clone(),
            })
    }
}
