//! Agent runtime seam.
//!
//! The LLM backend is an external collaborator reached through two traits:
//! [`SessionClient`] for conversation sessions and prompts, and
//! [`QuestionClient`] for asking the human a structured question. Answers to
//! those questions come back asynchronously through
//! [`HitlService`](crate::hitl::HitlService).
//!
//! [`ScriptedRuntime`] implements both traits in memory with queued replies
//! per agent, for tests and offline demos.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hitl::UserQuestion;
use crate::ids::{self, IdKind};

/// One part of a message sent to or received from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

/// Join the text parts of a response with newlines; other parts are ignored.
pub fn extract_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub session_id: String,
    pub directory: PathBuf,
    pub agent: String,
    pub parts: Vec<MessagePart>,
}

/// Conversation sessions backed by an LLM.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        directory: &Path,
        title: &str,
    ) -> Result<SessionInfo>;

    /// Fetch a session if it is still valid.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>>;

    /// Send a message and return the parts of the reply.
    async fn prompt(&self, request: PromptRequest) -> Result<Vec<MessagePart>>;
}

/// Issues human-in-the-loop questions; returns the question id.
#[async_trait]
pub trait QuestionClient: Send + Sync {
    async fn ask(&self, session_id: &str, questions: &[UserQuestion]) -> Result<String>;
}

/// A queued reply for [`ScriptedRuntime`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// A single text part.
    Text(String),
    /// Arbitrary parts, e.g. tool calls mixed with text.
    Parts(Vec<MessagePart>),
    /// The prompt call fails.
    Fail(String),
    /// The prompt call never completes.
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    sessions: HashMap<String, SessionInfo>,
    replies: HashMap<String, VecDeque<ScriptedReply>>,
    prompts: Vec<PromptRequest>,
    questions: Vec<(String, String, Vec<UserQuestion>)>,
    fail_session_create: bool,
}

/// In-memory runtime with per-agent reply queues.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    state: Mutex<ScriptState>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Queue a reply for the next prompt addressed to `agent`.
    pub fn push_reply(&self, agent: &str, reply: ScriptedReply) {
        self.with_state(|s| {
            s.replies
                .entry(agent.to_string())
                .or_default()
                .push_back(reply)
        });
    }

    pub fn push_text(&self, agent: &str, text: &str) {
        self.push_reply(agent, ScriptedReply::Text(text.to_string()));
    }

    pub fn set_fail_session_create(&self, fail: bool) {
        self.with_state(|s| s.fail_session_create = fail);
    }

    /// Drop a session so later lookups miss.
    pub fn forget_session(&self, session_id: &str) {
        self.with_state(|s| s.sessions.remove(session_id));
    }

    pub fn session_count(&self) -> usize {
        self.with_state(|s| s.sessions.len())
    }

    pub fn prompts(&self) -> Vec<PromptRequest> {
        self.with_state(|s| s.prompts.clone())
    }

    pub fn prompts_for(&self, agent: &str) -> Vec<PromptRequest> {
        self.with_state(|s| {
            s.prompts
                .iter()
                .filter(|p| p.agent == agent)
                .cloned()
                .collect()
        })
    }

    /// `(question_id, session_id, questions)` of every question asked.
    pub fn questions(&self) -> Vec<(String, String, Vec<UserQuestion>)> {
        self.with_state(|s| s.questions.clone())
    }
}

#[async_trait]
impl SessionClient for ScriptedRuntime {
    async fn create_session(
        &self,
        parent_id: Option<&str>,
        _directory: &Path,
        title: &str,
    ) -> Result<SessionInfo> {
        self.with_state(|s| {
            if s.fail_session_create {
                return Err(Error::Runtime("session creation refused".to_string()));
            }
            let info = SessionInfo {
                id: ids::generate_id(IdKind::Session),
                title: title.to_string(),
                parent_id: parent_id.map(str::to_string),
            };
            s.sessions.insert(info.id.clone(), info.clone());
            Ok(info)
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.with_state(|s| s.sessions.get(session_id).cloned()))
    }

    async fn prompt(&self, request: PromptRequest) -> Result<Vec<MessagePart>> {
        let agent = request.agent.clone();
        let reply = self.with_state(|s| {
            s.prompts.push(request);
            s.replies.get_mut(&agent).and_then(VecDeque::pop_front)
        });
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(vec![MessagePart::text(text)]),
            Some(ScriptedReply::Parts(parts)) => Ok(parts),
            Some(ScriptedReply::Fail(message)) => Err(Error::Runtime(message)),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<()>().await;
                Err(Error::Cancelled)
            }
            None => Err(Error::Runtime(format!("no scripted reply for agent {}", agent))),
        }
    }
}

#[async_trait]
impl QuestionClient for ScriptedRuntime {
    async fn ask(&self, session_id: &str, questions: &[UserQuestion]) -> Result<String> {
        let id = ids::generate_id(IdKind::Question);
        self.with_state(|s| {
            s.questions
                .push((id.clone(), session_id.to_string(), questions.to_vec()))
        });
        Ok(id)
    }
}
