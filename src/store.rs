//! JSON document storage for plans and executions.
//!
//! Layout under the working directory:
//!
//! ```text
//! <workdir>/.opencode/plans/<plan_id>.json                 one Plan
//! <workdir>/.opencode/plans/<plan_id>/<execution_id>.json  one PlanExecution per run
//! ```
//!
//! Documents are pretty-printed with a trailing newline and replaced whole on
//! every write. Reads of a missing file yield `None`; a file that does not
//! parse is an error naming its path. There is no locking: one writer per
//! document at a time.
//!
//! Ids become file names, so only ASCII letters, digits, `_` and `-` are
//! accepted; anything else is [`Error::InvalidId`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::execution::PlanExecution;
use crate::log::Logger;
use crate::plan::Plan;
use crate::{mlog_debug, Error, Result};

const STATE_DIR: &str = ".opencode";
const PLANS_DIR: &str = "plans";
const EXTENSION: &str = "json";

fn check_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    logger: Logger,
}

impl Store {
    pub fn new(workdir: &Path, logger: Logger) -> Self {
        Self {
            root: workdir.join(STATE_DIR).join(PLANS_DIR),
            logger,
        }
    }

    /// Directory holding every plan document.
    pub fn plans_dir(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", plan_id, EXTENSION))
    }

    pub fn executions_dir(&self, plan_id: &str) -> PathBuf {
        self.root.join(plan_id)
    }

    pub fn execution_path(&self, plan_id: &str, execution_id: &str) -> PathBuf {
        self.executions_dir(plan_id)
            .join(format!("{}.{}", execution_id, EXTENSION))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| Error::CorruptDocument {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut content = serde_json::to_string_pretty(value)?;
        content.push('\n');

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        mlog_debug!(self.logger, "Store::write path={}", path.display());
        Ok(())
    }

    /// Document stems in `dir` with the `.json` extension.
    async fn list_ids(&self, dir: &Path) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    pub async fn load_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        check_id(plan_id)?;
        self.read_json(&self.plan_path(plan_id)).await
    }

    pub async fn save_plan(&self, plan: &Plan) -> Result<()> {
        check_id(&plan.plan_id)?;
        self.write_json(&self.plan_path(&plan.plan_id), plan).await
    }

    /// Ids of all stored plans, unordered.
    pub async fn plan_ids(&self) -> Result<Vec<String>> {
        self.list_ids(&self.root).await
    }

    /// Delete a plan document and every execution stored under it.
    /// Returns `false` when the plan did not exist.
    pub async fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        check_id(plan_id)?;
        let existed = match tokio::fs::remove_file(self.plan_path(plan_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(Error::Io(e)),
        };
        match tokio::fs::remove_dir_all(self.executions_dir(plan_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        mlog_debug!(self.logger, "Store::delete_plan id={} existed={}", plan_id, existed);
        Ok(existed)
    }

    pub async fn load_execution(
        &self,
        plan_id: &str,
        execution_id: &str,
    ) -> Result<Option<PlanExecution>> {
        check_id(plan_id)?;
        check_id(execution_id)?;
        self.read_json(&self.execution_path(plan_id, execution_id))
            .await
    }

    pub async fn save_execution(&self, execution: &PlanExecution) -> Result<()> {
        check_id(&execution.plan_id)?;
        check_id(&execution.execution_id)?;
        let path = self.execution_path(&execution.plan_id, &execution.execution_id);
        self.write_json(&path, execution).await
    }

    /// Ids of all executions of `plan_id`, unordered.
    pub async fn execution_ids(&self, plan_id: &str) -> Result<Vec<String>> {
        check_id(plan_id)?;
        self.list_ids(&self.executions_dir(plan_id)).await
    }

    /// Locate an execution without knowing its plan by scanning plan directories.
    pub async fn find_execution(&self, execution_id: &str) -> Result<Option<PlanExecution>> {
        check_id(execution_id)?;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry
                .path()
                .join(format!("{}.{}", execution_id, EXTENSION));
            if let Some(execution) = self.read_json(&path).await? {
                return Ok(Some(execution));
            }
        }
        Ok(None)
    }
}
