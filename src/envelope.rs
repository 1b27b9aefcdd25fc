//! Message envelope wire protocol.
//!
//! Every message exchanged with an agent is a JSON object discriminated by a
//! top-level `type`. Request envelopes (`task`, `interrupt`) carry the
//! `session_id` of the conversation they belong to; response envelopes do not.
//! `failure` additionally omits `agent_id` since an error can be raised before
//! any agent is resolved.
//!
//! Envelopes are closed: unknown keys anywhere are rejected. [`decode_envelope`]
//! reports every problem it finds as a [`ValidationIssue`] so the agent can be
//! told exactly what to fix.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ids;
use crate::plan::PlanStep;

/// RFC 3339 UTC instant. Decoding requires the `Z` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if !s.ends_with('Z') {
            return Err("Invalid datetime: expected UTC with 'Z' suffix".to_string());
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| format!("Invalid datetime: {}", e))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Protocol-level failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ValidationError,
    UnknownAgent,
    SessionNotFound,
    AgentError,
    Timeout,
}

impl FailureCode {
    pub const ALL: [FailureCode; 5] = [
        FailureCode::ValidationError,
        FailureCode::UnknownAgent,
        FailureCode::SessionNotFound,
        FailureCode::AgentError,
        FailureCode::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ValidationError => "VALIDATION_ERROR",
            FailureCode::UnknownAgent => "UNKNOWN_AGENT",
            FailureCode::SessionNotFound => "SESSION_NOT_FOUND",
            FailureCode::AgentError => "AGENT_ERROR",
            FailureCode::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a dispatched task inside a plan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanContext {
    pub plan_id: String,
    pub step_index: usize,
    pub total_steps: usize,
    /// Set once the user approved every remaining step of this plan.
    #[serde(default)]
    pub approved_remaining: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEnvelope {
    pub session_id: String,
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_approach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_context: Option<PlanContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptEnvelope {
    pub session_id: String,
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerEnvelope {
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuestionEnvelope {
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuccessEnvelope {
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanEnvelope {
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
    pub verification: Vec<String>,
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointEnvelope {
    pub timestamp: Timestamp,
    pub agent_id: String,
    pub message: String,
    pub target_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureEnvelope {
    pub timestamp: Timestamp,
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEnvelope {
    Task(TaskEnvelope),
    Interrupt(InterruptEnvelope),
    Answer(AnswerEnvelope),
    Question(QuestionEnvelope),
    Success(SuccessEnvelope),
    Plan(PlanEnvelope),
    Checkpoint(CheckpointEnvelope),
    Failure(FailureEnvelope),
}

impl MessageEnvelope {
    pub fn answer(agent_id: &str, content: &str) -> Self {
        MessageEnvelope::Answer(AnswerEnvelope {
            timestamp: Timestamp::now(),
            agent_id: agent_id.to_string(),
            content: content.to_string(),
        })
    }

    pub fn failure(code: FailureCode, message: impl Into<String>, cause: Option<String>) -> Self {
        MessageEnvelope::Failure(FailureEnvelope {
            timestamp: Timestamp::now(),
            code,
            message: message.into(),
            cause,
        })
    }

    /// The wire `type` of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageEnvelope::Task(_) => "task",
            MessageEnvelope::Interrupt(_) => "interrupt",
            MessageEnvelope::Answer(_) => "answer",
            MessageEnvelope::Question(_) => "question",
            MessageEnvelope::Success(_) => "success",
            MessageEnvelope::Plan(_) => "plan",
            MessageEnvelope::Checkpoint(_) => "checkpoint",
            MessageEnvelope::Failure(_) => "failure",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageEnvelope::Task(_) | MessageEnvelope::Interrupt(_)
        )
    }

    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            MessageEnvelope::Failure(f) => Some(f.code),
            _ => None,
        }
    }
}

/// One problem found while decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path to the offending value; empty for the root.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "(root)"
        } else {
            &self.path
        };
        write!(f, "{}: {}", path, self.message)
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    NonEmptyText,
    Timestamp,
    SessionId,
    TextList,
    Steps,
    PlanContext,
    Index,
    Code,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

const ENVELOPE_TYPES: &[&str] = &[
    "task",
    "interrupt",
    "answer",
    "question",
    "success",
    "plan",
    "checkpoint",
    "failure",
];

fn fields_for(kind: &str) -> Option<&'static [FieldSpec]> {
    use FieldKind::*;
    const TASK: &[FieldSpec] = &[
        req("session_id", SessionId),
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("description", NonEmptyText),
        opt("suggested_approach", Text),
        opt("plan_context", PlanContext),
    ];
    const INTERRUPT: &[FieldSpec] = &[
        req("session_id", SessionId),
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("reason", Text),
    ];
    const ANSWER: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("content", Text),
    ];
    const QUESTION: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("question", NonEmptyText),
        opt("options", TextList),
        opt("context", Text),
    ];
    const SUCCESS: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("summary", Text),
        opt("artifacts", TextList),
    ];
    const PLAN: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("goal", NonEmptyText),
        opt("summary", Text),
        req("steps", Steps),
        req("assumptions", TextList),
        req("verification", TextList),
        req("risks", TextList),
    ];
    const CHECKPOINT: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("agent_id", NonEmptyText),
        req("message", Text),
        req("target_agent", NonEmptyText),
        opt("plan_id", Text),
        opt("step_index", Index),
    ];
    const FAILURE: &[FieldSpec] = &[
        req("timestamp", Timestamp),
        req("code", Code),
        req("message", Text),
        opt("cause", Text),
    ];

    match kind {
        "task" => Some(TASK),
        "interrupt" => Some(INTERRUPT),
        "answer" => Some(ANSWER),
        "question" => Some(QUESTION),
        "success" => Some(SUCCESS),
        "plan" => Some(PLAN),
        "checkpoint" => Some(CHECKPOINT),
        "failure" => Some(FAILURE),
        _ => None,
    }
}

fn check_field(spec: &FieldSpec, value: &Value, issues: &mut Vec<ValidationIssue>) {
    let path = spec.name;
    if value.is_null() && !spec.required {
        return;
    }
    match spec.kind {
        FieldKind::Text => {
            if !value.is_string() {
                issues.push(ValidationIssue::new(path, "Expected string"));
            }
        }
        FieldKind::NonEmptyText => match value.as_str() {
            Some(s) if s.trim().is_empty() => {
                issues.push(ValidationIssue::new(path, "String must not be empty"))
            }
            Some(_) => {}
            None => issues.push(ValidationIssue::new(path, "Expected string")),
        },
        FieldKind::Timestamp => match value.as_str() {
            Some(s) => {
                if let Err(e) = Timestamp::parse(s) {
                    issues.push(ValidationIssue::new(path, e));
                }
            }
            None => issues.push(ValidationIssue::new(path, "Expected ISO-8601 string")),
        },
        FieldKind::SessionId => match value.as_str() {
            Some(s) if ids::is_valid_id(ids::IdKind::Session.prefix(), s) => {}
            Some(_) => issues.push(ValidationIssue::new(
                path,
                "Invalid session id: expected ses_<26 chars>",
            )),
            None => issues.push(ValidationIssue::new(path, "Expected string")),
        },
        FieldKind::TextList => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        issues.push(ValidationIssue::new(
                            format!("{}.{}", path, i),
                            "Expected string",
                        ));
                    }
                }
            }
            None => issues.push(ValidationIssue::new(path, "Expected array")),
        },
        FieldKind::Steps => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let step_path = format!("{}.{}", path, i);
                    match serde_json::from_value::<PlanStep>(item.clone()) {
                        Ok(step) => {
                            if step.description.trim().is_empty() {
                                issues.push(ValidationIssue::new(
                                    format!("{}.description", step_path),
                                    "String must not be empty",
                                ));
                            }
                            if step.agent.trim().is_empty() {
                                issues.push(ValidationIssue::new(
                                    format!("{}.agent", step_path),
                                    "String must not be empty",
                                ));
                            }
                        }
                        Err(e) => issues.push(ValidationIssue::new(step_path, e.to_string())),
                    }
                }
            }
            None => issues.push(ValidationIssue::new(path, "Expected array")),
        },
        FieldKind::PlanContext => {
            if let Err(e) = serde_json::from_value::<PlanContext>(value.clone()) {
                issues.push(ValidationIssue::new(path, e.to_string()));
            }
        }
        FieldKind::Index => {
            if value.as_u64().is_none() {
                issues.push(ValidationIssue::new(path, "Expected non-negative integer"));
            }
        }
        FieldKind::Code => {
            let known = value
                .as_str()
                .map(|s| FailureCode::ALL.iter().any(|c| c.as_str() == s))
                .unwrap_or(false);
            if !known {
                let expected: Vec<&str> = FailureCode::ALL.iter().map(|c| c.as_str()).collect();
                issues.push(ValidationIssue::new(
                    path,
                    format!("Invalid enum value. Expected {}", expected.join(" | ")),
                ));
            }
        }
    }
}

/// Decode a parsed JSON value into an envelope, collecting every issue.
pub fn decode_envelope(value: &Value) -> Result<MessageEnvelope, Vec<ValidationIssue>> {
    let Some(object) = value.as_object() else {
        return Err(vec![ValidationIssue::new("", "Expected object")]);
    };

    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.as_str(),
        Some(_) => return Err(vec![ValidationIssue::new("type", "Expected string")]),
        None => return Err(vec![ValidationIssue::new("type", "Required")]),
    };
    let Some(specs) = fields_for(kind) else {
        return Err(vec![ValidationIssue::new(
            "type",
            format!(
                "Invalid discriminator value. Expected {}",
                ENVELOPE_TYPES
                    .iter()
                    .map(|t| format!("'{}'", t))
                    .collect::<Vec<_>>()
                    .join(" | ")
            ),
        )]);
    };

    let mut issues = Vec::new();
    for key in object.keys() {
        if key != "type" && !specs.iter().any(|s| s.name == key) {
            issues.push(ValidationIssue::new(
                key.as_str(),
                format!("Unrecognized key for '{}' envelope", kind),
            ));
        }
    }
    for spec in specs {
        match object.get(spec.name) {
            Some(value) => check_field(spec, value, &mut issues),
            None if spec.required => issues.push(ValidationIssue::new(spec.name, "Required")),
            None => {}
        }
    }
    if !issues.is_empty() {
        return Err(issues);
    }

    // An explicit null on an optional field means absent.
    let mut object = object.clone();
    object.retain(|key, value| {
        !(value.is_null() && specs.iter().any(|s| s.name == key && !s.required))
    });
    serde_json::from_value(Value::Object(object))
        .map_err(|e| vec![ValidationIssue::new("", e.to_string())])
}
