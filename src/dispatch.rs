//! Dispatch of tasks and questions to named agents.
//!
//! A dispatch resolves the agent, applies the supervision gate, resolves or
//! creates a conversation session, prompts the agent and validates the reply.
//! Every agent-communication problem comes back as a `failure` envelope;
//! nothing here returns `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentConfig, AgentRegistry};
use crate::envelope::{CheckpointEnvelope, FailureCode, MessageEnvelope, PlanContext, Timestamp};
use crate::error::{Error, Result};
use crate::log::Logger;
use crate::runtime::{extract_text, MessagePart, PromptRequest, SessionClient};
use crate::validator::{validate_with_retry, CorrectionChannel};
use crate::{mlog_debug, mlog_error, mlog_trace, mlog_warn};

/// `agent_id` used on envelopes the orchestration itself produces.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

const TITLE_MAX_CHARS: usize = 60;

/// Where and under what cancellation a dispatch runs.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Session new agent sessions are created under.
    pub parent_session_id: Option<String>,
    pub directory: PathBuf,
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new(directory: &Path) -> Self {
        Self {
            parent_session_id: None,
            directory: directory.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parent(mut self, session_id: &str) -> Self {
        self.parent_session_id = Some(session_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRequest {
    pub agent: String,
    pub description: String,
    pub suggested_approach: Option<String>,
    /// Session to continue; a fresh one is created when absent or stale.
    pub session_id: Option<String>,
    pub plan_context: Option<PlanContext>,
}

impl TaskRequest {
    pub fn new(agent: &str, description: &str) -> Self {
        Self {
            agent: agent.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestionRequest {
    pub agent: String,
    pub question: String,
    pub context: Option<String>,
    pub session_id: Option<String>,
}

/// Validated reply plus the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub result: MessageEnvelope,
    pub session_id: Option<String>,
}

impl DispatchOutcome {
    fn without_session(result: MessageEnvelope) -> Self {
        Self {
            result,
            session_id: None,
        }
    }
}

/// Render a task as the markdown prompt agents receive.
pub fn format_task_prompt(request: &TaskRequest) -> String {
    let mut prompt = format!("## Task\n\n{}", request.description);
    if let Some(approach) = &request.suggested_approach {
        prompt.push_str("\n\n### Suggested Approach\n\n");
        prompt.push_str(approach);
    }
    if let Some(ctx) = &request.plan_context {
        prompt.push_str(&format!(
            "\n\n### Plan Context\n\nStep {} of {} in plan {}",
            ctx.step_index + 1,
            ctx.total_steps,
            ctx.plan_id
        ));
    }
    prompt
}

pub fn format_question_prompt(request: &QuestionRequest) -> String {
    let mut prompt = format!("## Question\n\n{}", request.question);
    if let Some(context) = &request.context {
        prompt.push_str("\n\n### Context\n\n");
        prompt.push_str(context);
    }
    prompt
}

fn session_title(agent: &str, text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    format!("{}: {}", agent, title)
}

/// Corrections go back to the agent as new prompts on the same session.
struct SessionChannel<'a> {
    sessions: &'a dyn SessionClient,
    session_id: &'a str,
    directory: &'a Path,
    agent: &'a str,
    logger: &'a Logger,
}

#[async_trait]
impl CorrectionChannel for SessionChannel<'_> {
    async fn send_correction(&self, correction: &str) -> Result<String> {
        let parts = self
            .sessions
            .prompt(PromptRequest {
                session_id: self.session_id.to_string(),
                directory: self.directory.to_path_buf(),
                agent: self.agent.to_string(),
                parts: vec![MessagePart::text(correction)],
            })
            .await?;
        let text = extract_text(&parts);
        mlog_trace!(self.logger, "Corrected response from {}: {}", self.agent, text);
        Ok(text)
    }
}

pub struct DispatchService {
    sessions: Arc<dyn SessionClient>,
    registry: Arc<AgentRegistry>,
    default_supervised: Option<bool>,
    logger: Logger,
}

impl DispatchService {
    pub fn new(
        sessions: Arc<dyn SessionClient>,
        registry: Arc<AgentRegistry>,
        default_supervised: Option<bool>,
        logger: Logger,
    ) -> Self {
        Self {
            sessions,
            registry,
            default_supervised,
            logger,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    fn resolve_agent(&self, name: &str) -> std::result::Result<&AgentConfig, DispatchOutcome> {
        self.registry.get(name).ok_or_else(|| {
            mlog_warn!(self.logger, "Dispatch to unknown agent {}", name);
            DispatchOutcome::without_session(MessageEnvelope::failure(
                FailureCode::UnknownAgent,
                format!(
                    "Unknown agent: {}. Available agents: {}",
                    name,
                    self.registry.names().join(", ")
                ),
                None,
            ))
        })
    }

    /// Send a task to an agent, subject to its supervision gate.
    pub async fn dispatch_task(&self, ctx: &DispatchContext, request: TaskRequest) -> DispatchOutcome {
        let agent = match self.resolve_agent(&request.agent) {
            Ok(agent) => agent,
            Err(outcome) => return outcome,
        };

        let approved = request
            .plan_context
            .as_ref()
            .is_some_and(|c| c.approved_remaining);
        if agent.is_supervised(self.default_supervised) && !approved {
            mlog_debug!(self.logger, "Dispatch to {} held at checkpoint", agent.name);
            return DispatchOutcome {
                result: MessageEnvelope::Checkpoint(CheckpointEnvelope {
                    timestamp: Timestamp::now(),
                    agent_id: ORCHESTRATOR_ID.to_string(),
                    message: format!(
                        "Agent {} is supervised. Approve before it runs: {}",
                        agent.name, request.description
                    ),
                    target_agent: agent.name.clone(),
                    plan_id: request.plan_context.as_ref().map(|c| c.plan_id.clone()),
                    step_index: request.plan_context.as_ref().map(|c| c.step_index),
                }),
                session_id: request.session_id,
            };
        }

        let title = session_title(&agent.name, &request.description);
        let prompt = format_task_prompt(&request);
        self.run(ctx, agent, request.session_id.as_deref(), &title, prompt)
            .await
    }

    /// Ask an agent a question. Questions are never gated.
    pub async fn dispatch_question(
        &self,
        ctx: &DispatchContext,
        request: QuestionRequest,
    ) -> DispatchOutcome {
        let agent = match self.resolve_agent(&request.agent) {
            Ok(agent) => agent,
            Err(outcome) => return outcome,
        };
        let title = session_title(&agent.name, &request.question);
        let prompt = format_question_prompt(&request);
        self.run(ctx, agent, request.session_id.as_deref(), &title, prompt)
            .await
    }

    /// Relay the user's answer to an agent's question on its session.
    pub async fn send_answer(
        &self,
        ctx: &DispatchContext,
        agent: &str,
        session_id: &str,
        answer: &str,
    ) -> DispatchOutcome {
        let agent = match self.resolve_agent(agent) {
            Ok(agent) => agent,
            Err(outcome) => return outcome,
        };
        let prompt = format!("## Answer\n\n{}", answer);
        let title = session_title(&agent.name, answer);
        self.run(ctx, agent, Some(session_id), &title, prompt).await
    }

    async fn run(
        &self,
        ctx: &DispatchContext,
        agent: &AgentConfig,
        session_id: Option<&str>,
        title: &str,
        prompt: String,
    ) -> DispatchOutcome {
        mlog_debug!(self.logger, "Dispatch to {} started", agent.name);
        let mut session = None;
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
            r = self.converse(ctx, agent, session_id, title, prompt, &mut session) => r,
        };
        let session_id = session.or_else(|| session_id.map(str::to_string));

        let result = match result {
            _ if ctx.cancel.is_cancelled() => MessageEnvelope::failure(
                FailureCode::Timeout,
                format!("Dispatch to {} was cancelled", agent.name),
                None,
            ),
            Ok(envelope) => envelope,
            Err(e) => {
                mlog_error!(self.logger, "Dispatch to {} failed: {}", agent.name, e);
                MessageEnvelope::failure(
                    FailureCode::AgentError,
                    format!("Dispatch to {} failed", agent.name),
                    Some(e.to_string()),
                )
            }
        };
        mlog_debug!(
            self.logger,
            "Dispatch to {} finished with {}",
            agent.name,
            result.kind()
        );
        DispatchOutcome { result, session_id }
    }

    async fn resolve_session(
        &self,
        ctx: &DispatchContext,
        session_id: Option<&str>,
        title: &str,
    ) -> Result<String> {
        if let Some(id) = session_id {
            match self.sessions.get_session(id).await {
                Ok(Some(info)) => return Ok(info.id),
                Ok(None) => mlog_debug!(self.logger, "Session {} is gone, creating a new one", id),
                Err(e) => mlog_debug!(self.logger, "Session {} lookup failed: {}", id, e),
            }
        }
        let info = self
            .sessions
            .create_session(ctx.parent_session_id.as_deref(), &ctx.directory, title)
            .await?;
        mlog_debug!(self.logger, "Created session {} ({})", info.id, title);
        Ok(info.id)
    }

    async fn converse(
        &self,
        ctx: &DispatchContext,
        agent: &AgentConfig,
        session_id: Option<&str>,
        title: &str,
        prompt: String,
        session_slot: &mut Option<String>,
    ) -> Result<MessageEnvelope> {
        let session = match self.resolve_session(ctx, session_id, title).await {
            Ok(id) => id,
            Err(e) => {
                return Ok(MessageEnvelope::failure(
                    FailureCode::SessionNotFound,
                    format!("Could not open a session for agent {}", agent.name),
                    Some(e.to_string()),
                ))
            }
        };
        *session_slot = Some(session.clone());

        let parts = self
            .sessions
            .prompt(PromptRequest {
                session_id: session.clone(),
                directory: ctx.directory.clone(),
                agent: agent.name.clone(),
                parts: vec![MessagePart::text(prompt)],
            })
            .await?;
        let text = extract_text(&parts);
        mlog_trace!(self.logger, "Raw response from {} in {}: {}", agent.name, session, text);
        if text.trim().is_empty() {
            return Ok(MessageEnvelope::failure(
                FailureCode::AgentError,
                format!("Agent {} returned an empty response", agent.name),
                None,
            ));
        }

        let channel = SessionChannel {
            sessions: self.sessions.as_ref(),
            session_id: &session,
            directory: &ctx.directory,
            agent: &agent.name,
            logger: &self.logger,
        };
        validate_with_retry(&text, agent, Some(&channel), &self.logger).await
    }
}
