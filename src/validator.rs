//! Agent response validation with agent-directed correction.
//!
//! A raw agent reply is fence-stripped, optionally wrapped as an `answer`
//! when it is plain text, parsed as JSON and decoded as a
//! [`MessageEnvelope`]. On failure the agent is shown every issue through a
//! [`CorrectionChannel`] and gets another attempt, up to the agent's
//! `max_retries`.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::agents::AgentConfig;
use crate::envelope::{decode_envelope, FailureCode, MessageEnvelope, ValidationIssue};
use crate::error::Result;
use crate::log::Logger;
use crate::{mlog_debug, mlog_warn};

/// A single markdown fence around the whole reply: ``` or ```json.
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*```(?:json)?[ \t]*\r?\n?(.*?)\s*```\s*$").unwrap());

/// Sends a correction to the agent and returns its next raw reply.
#[async_trait]
pub trait CorrectionChannel: Send + Sync {
    async fn send_correction(&self, correction: &str) -> Result<String>;
}

/// Why one validation attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    InvalidJson(String),
    Schema(Vec<ValidationIssue>),
}

impl ResponseError {
    pub fn issues(&self) -> Vec<String> {
        match self {
            ResponseError::InvalidJson(e) => vec![format!("(root): Invalid JSON: {}", e)],
            ResponseError::Schema(issues) => issues.iter().map(ToString::to_string).collect(),
        }
    }

    /// One-line detail used as the failure cause.
    pub fn detail(&self) -> String {
        match self {
            ResponseError::InvalidJson(e) => format!("Invalid JSON: {}", e),
            ResponseError::Schema(_) => format!("Schema validation failed: {}", self.issues().join("; ")),
        }
    }

    /// Message sent back to the agent asking for a corrected reply.
    pub fn correction_prompt(&self) -> String {
        let mut prompt = String::from(
            "Your previous response was not a valid message envelope.\n\nIssues:\n",
        );
        for issue in self.issues() {
            prompt.push_str("- ");
            prompt.push_str(&issue);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nRespond again with a single JSON object whose `type` selects the envelope. \
             Do not add fields the envelope does not define.",
        );
        prompt
    }
}

/// Remove one enclosing code fence and surrounding whitespace.
pub fn strip_code_fence(raw: &str) -> &str {
    match FENCE_RE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => raw.trim(),
    }
}

fn looks_like_json(content: &str) -> bool {
    content.starts_with('{') || content.starts_with('[')
}

/// A single validation attempt without retries.
pub fn validate_response(
    raw: &str,
    agent_id: &str,
    wrap_plain_text: bool,
) -> std::result::Result<MessageEnvelope, ResponseError> {
    let content = strip_code_fence(raw);
    if wrap_plain_text && !looks_like_json(content) {
        return Ok(MessageEnvelope::answer(agent_id, raw));
    }
    let value: Value =
        serde_json::from_str(content).map_err(|e| ResponseError::InvalidJson(e.to_string()))?;
    decode_envelope(&value).map_err(ResponseError::Schema)
}

/// Validate `raw` against the envelope protocol, re-prompting the agent through
/// `channel` while retries remain.
///
/// Exhausted retries yield a `VALIDATION_ERROR` failure envelope. Errors
/// from the channel itself propagate to the caller.
pub async fn validate_with_retry(
    raw: &str,
    agent: &AgentConfig,
    channel: Option<&dyn CorrectionChannel>,
    logger: &Logger,
) -> Result<MessageEnvelope> {
    let policy = agent.validation;
    let mut raw = raw.to_string();
    let mut retries = 0u32;

    loop {
        let err = match validate_response(&raw, &agent.name, policy.wrap_plain_text) {
            Ok(envelope) => {
                mlog_debug!(
                    logger,
                    "Validated {} envelope from {} after {} retries",
                    envelope.kind(),
                    agent.name,
                    retries
                );
                return Ok(envelope);
            }
            Err(err) => err,
        };

        match channel {
            Some(channel) if retries < policy.max_retries => {
                retries += 1;
                mlog_warn!(
                    logger,
                    "Invalid response from {} (retry {}/{}): {}",
                    agent.name,
                    retries,
                    policy.max_retries,
                    err.detail()
                );
                raw = channel.send_correction(&err.correction_prompt()).await?;
            }
            _ => {
                mlog_warn!(
                    logger,
                    "Giving up on response from {} after {} attempts",
                    agent.name,
                    retries + 1
                );
                return Ok(MessageEnvelope::failure(
                    FailureCode::ValidationError,
                    format!(
                        "Response from agent {} failed validation after {} attempt(s)",
                        agent.name,
                        retries + 1
                    ),
                    Some(err.detail()),
                ));
            }
        }
    }
}
