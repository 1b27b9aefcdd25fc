//! Human-in-the-loop questions.
//!
//! [`HitlService::ask`] sends a structured question through the
//! [`QuestionClient`], registers a single-shot resolver under the returned
//! question id and suspends until one of three things happens: the UI replies
//! ([`HitlService::handle_question_replied`]), the UI rejects
//! ([`HitlService::handle_question_rejected`]), or the per-question timeout
//! fires. The first of those wins and removes the entry; anything arriving
//! later for the same id is logged and ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Result;
use crate::log::Logger;
use crate::runtime::QuestionClient;
use crate::{mlog, mlog_debug, mlog_warn};

/// Default time a question waits for the human (5 minutes).
pub const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A question shown to the user: short header, free text and options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuestion {
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multiple: bool,
}

impl UserQuestion {
    pub fn new(header: &str, question: &str) -> Self {
        Self {
            header: header.to_string(),
            question: question.to_string(),
            options: Vec::new(),
            multiple: false,
        }
    }

    pub fn with_option(mut self, label: &str, description: Option<&str>) -> Self {
        self.options.push(QuestionOption {
            label: label.to_string(),
            description: description.map(str::to_string),
        });
        self
    }
}

/// The user's reply: one list of selected labels (or free text) per question.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserAnswer {
    pub answers: Vec<Vec<String>>,
}

impl UserAnswer {
    pub fn single(answer: &str) -> Self {
        Self {
            answers: vec![vec![answer.to_string()]],
        }
    }

    /// First selection of the first question.
    pub fn first(&self) -> Option<&str> {
        self.answers
            .first()
            .and_then(|a| a.first())
            .map(String::as_str)
    }

    /// All selections flattened into one line per question.
    pub fn to_text(&self) -> String {
        self.answers
            .iter()
            .map(|a| a.join(", "))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How a question was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionOutcome {
    Answered(UserAnswer),
    Rejected,
    TimedOut,
}

/// Removes a question from the pending table when its `ask` ends, including
/// when the waiting future is dropped.
struct PendingEntry<'a> {
    service: &'a HitlService,
    question_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.service.take(self.question_id).is_some() {
            mlog_debug!(
                self.service.logger,
                "HITL question {} abandoned by its caller",
                self.question_id
            );
        }
    }
}

/// Correlates outstanding questions with their eventual replies.
pub struct HitlService {
    client: Arc<dyn QuestionClient>,
    pending: Mutex<HashMap<String, oneshot::Sender<QuestionOutcome>>>,
    timeout: Duration,
    logger: Logger,
}

impl HitlService {
    pub fn new(client: Arc<dyn QuestionClient>, timeout: Duration, logger: Logger) -> Self {
        Self {
            client,
            pending: Mutex::new(HashMap::new()),
            timeout,
            logger,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn with_pending<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, oneshot::Sender<QuestionOutcome>>) -> T,
    ) -> T {
        let mut guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn take(&self, question_id: &str) -> Option<oneshot::Sender<QuestionOutcome>> {
        self.with_pending(|p| p.remove(question_id))
    }

    /// Number of questions still waiting for a resolution.
    pub fn pending_count(&self) -> usize {
        self.with_pending(|p| p.len())
    }

    /// Ask and wait for the first resolution.
    pub async fn ask(
        &self,
        session_id: &str,
        questions: Vec<UserQuestion>,
    ) -> Result<QuestionOutcome> {
        let question_id = self.client.ask(session_id, &questions).await?;
        let (tx, mut rx) = oneshot::channel();
        self.with_pending(|p| p.insert(question_id.clone(), tx));
        let _entry = PendingEntry {
            service: self,
            question_id: &question_id,
        };
        mlog_debug!(
            self.logger,
            "HITL question {} asked in session {} ({} questions)",
            question_id,
            session_id,
            questions.len()
        );

        let outcome = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Resolver dropped without an answer (service shut down).
            Ok(Err(_)) => QuestionOutcome::Rejected,
            Err(_) => {
                if self.take(&question_id).is_some() {
                    mlog_warn!(
                        self.logger,
                        "HITL question {} timed out after {:?}",
                        question_id,
                        self.timeout
                    );
                    QuestionOutcome::TimedOut
                } else {
                    // A resolver took the entry first and sends (or drops) shortly.
                    rx.await.unwrap_or(QuestionOutcome::Rejected)
                }
            }
        };
        Ok(outcome)
    }

    /// Ask and return the answer, or `None` when rejected or timed out.
    pub async fn ask_user(
        &self,
        session_id: &str,
        questions: Vec<UserQuestion>,
    ) -> Result<Option<UserAnswer>> {
        match self.ask(session_id, questions).await? {
            QuestionOutcome::Answered(answer) => Ok(Some(answer)),
            QuestionOutcome::Rejected | QuestionOutcome::TimedOut => Ok(None),
        }
    }

    fn resolve(&self, question_id: &str, outcome: QuestionOutcome) -> bool {
        match self.take(question_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => {
                mlog_warn!(
                    self.logger,
                    "HITL event for {}: no pending question found",
                    question_id
                );
                false
            }
        }
    }

    /// External callback: the user answered. Returns `false` for unknown or
    /// already-resolved ids.
    pub fn handle_question_replied(&self, question_id: &str, answer: UserAnswer) -> bool {
        let resolved = self.resolve(question_id, QuestionOutcome::Answered(answer));
        if resolved {
            mlog!(self.logger, "HITL question {} answered", question_id);
        }
        resolved
    }

    /// External callback: the user dismissed the question.
    pub fn handle_question_rejected(&self, question_id: &str) -> bool {
        let resolved = self.resolve(question_id, QuestionOutcome::Rejected);
        if resolved {
            mlog!(self.logger, "HITL question {} rejected", question_id);
        }
        resolved
    }

    /// Reject every outstanding question.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.with_pending(|p| p.drain().collect());
        for (id, tx) in drained {
            mlog_debug!(self.logger, "HITL question {} rejected at shutdown", id);
            let _ = tx.send(QuestionOutcome::Rejected);
        }
    }
}

impl Drop for HitlService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
