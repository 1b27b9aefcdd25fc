use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::AgentMode;
use crate::hitl::DEFAULT_QUESTION_TIMEOUT_SECS;
use crate::log::Logger;
use crate::{mlog_debug, Error, Result};

const STATE_DIR: &str = ".opencode";
const PROJECT_CONFIG: &str = "maestro.toml";
const USER_DIR: &str = ".maestro";
const USER_CONFIG: &str = "config.toml";
const LOG_FILE: &str = "maestro.log";

/// Per-agent user override. Every field is optional; set fields win.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentOverride {
    pub mode: Option<AgentMode>,
    pub supervised: Option<bool>,
    pub specialist: Option<bool>,
    pub accepts: Option<Vec<String>>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub color: Option<String>,
    pub max_retries: Option<u32>,
    pub wrap_plain_text: Option<bool>,
    pub disabled: Option<bool>,
}

impl AgentOverride {
    /// Overlay the fields `other` sets.
    pub fn merge(&mut self, other: AgentOverride) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            mode,
            supervised,
            specialist,
            accepts,
            description,
            prompt,
            color,
            max_retries,
            wrap_plain_text,
            disabled
        );
    }
}

/// One configuration file as written by the user.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsLayer {
    default_supervised: Option<bool>,
    max_retries: Option<u32>,
    wrap_plain_text: Option<bool>,
    hitl_timeout_secs: Option<u64>,
    max_clarifications: Option<u32>,
    #[serde(default)]
    agents: BTreeMap<String, AgentOverride>,
}

/// Resolved orchestration settings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Settings {
    /// Supervision for agents that do not say; absent means unsupervised.
    pub default_supervised: Option<bool>,
    /// Validation retries for agents without their own policy.
    pub max_retries: u32,
    /// Wrap non-JSON agent output as an answer, for agents without their own policy.
    pub wrap_plain_text: bool,
    pub hitl_timeout_secs: u64,
    /// Bound on question/answer round trips within one dispatch.
    pub max_clarifications: u32,
    pub agents: BTreeMap<String, AgentOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_supervised: None,
            max_retries: 2,
            wrap_plain_text: false,
            hitl_timeout_secs: DEFAULT_QUESTION_TIMEOUT_SECS,
            max_clarifications: 3,
            agents: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn state_dir(workdir: &Path) -> PathBuf {
        workdir.join(STATE_DIR)
    }

    pub fn project_config_path(workdir: &Path) -> PathBuf {
        Self::state_dir(workdir).join(PROJECT_CONFIG)
    }

    pub fn user_config_path() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(USER_DIR)
            .join(USER_CONFIG))
    }

    pub fn log_path(workdir: &Path) -> PathBuf {
        Self::state_dir(workdir).join(LOG_FILE)
    }

    pub fn hitl_timeout(&self) -> Duration {
        Duration::from_secs(self.hitl_timeout_secs)
    }

    fn apply(&mut self, layer: SettingsLayer) {
        if layer.default_supervised.is_some() {
            self.default_supervised = layer.default_supervised;
        }
        if let Some(v) = layer.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = layer.wrap_plain_text {
            self.wrap_plain_text = v;
        }
        if let Some(v) = layer.hitl_timeout_secs {
            self.hitl_timeout_secs = v;
        }
        if let Some(v) = layer.max_clarifications {
            self.max_clarifications = v;
        }
        for (name, agent) in layer.agents {
            self.agents.entry(name).or_default().merge(agent);
        }
    }

    /// Apply a TOML document on top of the current settings.
    pub fn apply_toml(&mut self, content: &str) -> Result<()> {
        let layer: SettingsLayer = toml::from_str(content)?;
        self.apply(layer);
        Ok(())
    }

    /// Defaults overlaid with each existing file in order. Missing files are skipped.
    pub fn load_from(paths: &[PathBuf], logger: &Logger) -> Result<Self> {
        let mut settings = Self::default();
        for path in paths {
            if !path.exists() {
                mlog_debug!(logger, "Settings: {} not found, skipping", path.display());
                continue;
            }
            settings.apply_toml(&fs::read_to_string(path)?)?;
            mlog_debug!(logger, "Settings: applied {}", path.display());
        }
        Ok(settings)
    }

    /// User file (if a home directory exists) then the project file.
    pub fn load(workdir: &Path, logger: &Logger) -> Result<Self> {
        let mut paths = Vec::new();
        if let Ok(user) = Self::user_config_path() {
            paths.push(user);
        }
        paths.push(Self::project_config_path(workdir));
        Self::load_from(&paths, logger)
    }
}
