//! Agent registry.
//!
//! The registry is resolved from three layers: built-in agents, user
//! overrides from [`Settings`], and the protected orchestration agents whose
//! mode, availability and supervision cannot be overridden.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AgentOverride, Settings};
use crate::log::Logger;
use crate::{mlog_debug, mlog_warn};

/// The planning agent every user message is routed to first.
pub const PLANNER: &str = "planner";

/// Agents the orchestration itself depends on.
pub const PROTECTED_AGENTS: &[&str] = &[PLANNER];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Primary => write!(f, "primary"),
            AgentMode::Subagent => write!(f, "subagent"),
        }
    }
}

/// How strictly an agent's replies are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Correction round trips after the first attempt.
    pub max_retries: u32,
    /// Treat output that is not JSON as a plain answer.
    pub wrap_plain_text: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: String,
    pub mode: AgentMode,
    pub supervised: Option<bool>,
    pub specialist: bool,
    /// Envelope types the agent is prompted with.
    pub accepts: Vec<String>,
    pub description: String,
    pub prompt: Option<String>,
    pub color: Option<String>,
    pub validation: ValidationPolicy,
}

impl AgentConfig {
    pub fn subagent(name: &str, description: &str, validation: ValidationPolicy) -> Self {
        Self {
            name: name.to_string(),
            mode: AgentMode::Subagent,
            supervised: None,
            specialist: true,
            accepts: vec!["task".to_string(), "question".to_string()],
            description: description.to_string(),
            prompt: None,
            color: None,
            validation,
        }
    }

    /// `agent.supervised ?? default_supervised ?? false`.
    pub fn is_supervised(&self, default_supervised: Option<bool>) -> bool {
        self.supervised.or(default_supervised).unwrap_or(false)
    }

    pub fn is_protected(&self) -> bool {
        PROTECTED_AGENTS.contains(&self.name.as_str())
    }

    fn apply(&mut self, o: &AgentOverride) {
        if let Some(mode) = o.mode {
            self.mode = mode;
        }
        if o.supervised.is_some() {
            self.supervised = o.supervised;
        }
        if let Some(specialist) = o.specialist {
            self.specialist = specialist;
        }
        if let Some(accepts) = &o.accepts {
            self.accepts = accepts.clone();
        }
        if let Some(description) = &o.description {
            self.description = description.clone();
        }
        if o.prompt.is_some() {
            self.prompt = o.prompt.clone();
        }
        if o.color.is_some() {
            self.color = o.color.clone();
        }
        if let Some(max_retries) = o.max_retries {
            self.validation.max_retries = max_retries;
        }
        if let Some(wrap) = o.wrap_plain_text {
            self.validation.wrap_plain_text = wrap;
        }
    }
}

fn builtin_agents(settings: &Settings) -> Vec<AgentConfig> {
    let policy = ValidationPolicy {
        max_retries: settings.max_retries,
        wrap_plain_text: settings.wrap_plain_text,
    };
    let planner = AgentConfig {
        name: PLANNER.to_string(),
        mode: AgentMode::Primary,
        supervised: Some(false),
        specialist: false,
        accepts: vec!["task".to_string()],
        description: "Turns user requests into step-by-step plans".to_string(),
        prompt: None,
        color: None,
        validation: ValidationPolicy {
            max_retries: settings.max_retries,
            wrap_plain_text: false,
        },
    };
    vec![
        planner,
        AgentConfig::subagent("coder", "Implements code changes", policy),
        AgentConfig::subagent("tester", "Writes and runs tests", policy),
        AgentConfig::subagent("reviewer", "Reviews changes for defects", policy),
        AgentConfig::subagent("researcher", "Investigates code and documentation", policy),
    ]
}

/// Resolved name → agent mapping consumed by dispatch.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentConfig>,
}

impl AgentRegistry {
    /// Merge built-ins with the user overrides in `settings`.
    pub fn resolve(settings: &Settings, logger: &Logger) -> Self {
        let mut agents: BTreeMap<String, AgentConfig> = builtin_agents(settings)
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
        let policy = ValidationPolicy {
            max_retries: settings.max_retries,
            wrap_plain_text: settings.wrap_plain_text,
        };

        for (name, o) in &settings.agents {
            let protected = PROTECTED_AGENTS.contains(&name.as_str());
            if protected {
                if o.disabled == Some(true) {
                    mlog_warn!(logger, "Agent {} is protected and cannot be disabled", name);
                }
                if o.mode.is_some_and(|m| m != AgentMode::Primary) {
                    mlog_warn!(logger, "Agent {} is protected; mode override ignored", name);
                }
                if o.supervised == Some(true) {
                    mlog_warn!(logger, "Agent {} is protected; supervision override ignored", name);
                }
            } else if o.disabled == Some(true) {
                mlog_debug!(logger, "Agent {} disabled by configuration", name);
                agents.remove(name);
                continue;
            }

            let agent = agents
                .entry(name.clone())
                .or_insert_with(|| AgentConfig::subagent(name, "", policy));
            agent.apply(o);

            if protected {
                agent.mode = AgentMode::Primary;
                agent.supervised = Some(false);
            }
        }

        Self { agents }
    }

    /// Build a registry from explicit agents, skipping the merge.
    pub fn from_agents(agents: impl IntoIterator<Item = AgentConfig>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }

    /// Agent names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
