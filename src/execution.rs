//! Plan executions: one run of an approved plan.
//!
//! An execution moves `pending -> running -> completed | failed | stopped`.
//! It owns one [`TaskRecord`] per plan step, index-aligned with `plan.steps`
//! for its whole life. Tasks move `pending -> running -> completed | failed`,
//! and a failed task may be restarted, which bumps its `retry_count`.
//!
//! Every service operation loads the execution document, checks its guard on
//! the in-memory copy and writes the whole document back. A failed guard
//! leaves the stored document untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{self, IdKind};
use crate::log::Logger;
use crate::plan::{Plan, PlanStep};
use crate::store::Store;
use crate::{mlog, mlog_debug};

/// Overall status of an execution, tagged by `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Completed {
        completed_at: DateTime<Utc>,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        failed_step: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_stop_reason: Option<String>,
    },
    Stopped {
        stopped_at: DateTime<Utc>,
        reason: String,
    },
}

impl ExecutionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running { .. } => "running",
            ExecutionStatus::Completed { .. } => "completed",
            ExecutionStatus::Failed { .. } => "failed",
            ExecutionStatus::Stopped { .. } => "stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed { .. }
                | ExecutionStatus::Failed { .. }
                | ExecutionStatus::Stopped { .. }
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a specialist produced for a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskOutput {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub raw_response: String,
}

/// Per-step task state, tagged by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskRecord {
    Pending,
    Running {
        started_at: DateTime<Utc>,
        context: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
        retry_count: u32,
    },
    Completed {
        completed_at: DateTime<Utc>,
        output: TaskOutput,
        #[serde(default)]
        retry_count: u32,
    },
    Failed {
        failed_at: DateTime<Utc>,
        error: String,
        #[serde(default)]
        retry_count: u32,
    },
}

impl TaskRecord {
    pub fn status_name(&self) -> &'static str {
        match self {
            TaskRecord::Pending => "pending",
            TaskRecord::Running { .. } => "running",
            TaskRecord::Completed { .. } => "completed",
            TaskRecord::Failed { .. } => "failed",
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            TaskRecord::Pending => 0,
            TaskRecord::Running { retry_count, .. }
            | TaskRecord::Completed { retry_count, .. }
            | TaskRecord::Failed { retry_count, .. } => *retry_count,
        }
    }

    pub fn agent_session_id(&self) -> Option<&str> {
        match self {
            TaskRecord::Running {
                agent_session_id, ..
            } => agent_session_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskRecord::Pending)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskRecord::Completed { .. })
    }
}

/// One run of an approved plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub execution_id: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub tasks: Vec<TaskRecord>,
}

impl PlanExecution {
    /// Build a pending execution with one pending task per plan step.
    pub fn new(plan: &Plan) -> Result<Self> {
        plan.ensure_executable()?;
        Ok(Self {
            execution_id: ids::generate_id(IdKind::Execution),
            plan_id: plan.plan_id.clone(),
            created_at: Utc::now(),
            status: ExecutionStatus::Pending,
            tasks: vec![TaskRecord::Pending; plan.steps.len()],
        })
    }

    fn stage_error(&self, verb: &'static str) -> Error {
        Error::InvalidExecutionStage {
            verb,
            stage: self.status.name().to_string(),
        }
    }

    fn ensure_running(&self, verb: &'static str) -> Result<()> {
        if !self.status.is_running() {
            return Err(self.stage_error(verb));
        }
        Ok(())
    }

    fn task_mut(&mut self, index: usize) -> Result<&mut TaskRecord> {
        let len = self.tasks.len();
        self.tasks
            .get_mut(index)
            .ok_or_else(|| Error::step_out_of_range(index, len))
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_completed()).count()
    }

    /// Lowest-index pending task, if any.
    pub fn next_pending(&self) -> Option<usize> {
        self.tasks.iter().position(TaskRecord::is_pending)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Pending {
            return Err(self.stage_error("start"));
        }
        self.status = ExecutionStatus::Running {
            started_at: Utc::now(),
        };
        Ok(())
    }

    /// Move task `index` to running. Legal from pending (retry 0) or failed
    /// (previous retry count + 1).
    pub fn start_task(
        &mut self,
        index: usize,
        context: &str,
        agent_session_id: Option<String>,
    ) -> Result<()> {
        self.ensure_running("start a task of")?;
        let task = self.task_mut(index)?;
        let retry_count = match task {
            TaskRecord::Pending => 0,
            TaskRecord::Failed { retry_count, .. } => *retry_count + 1,
            other => {
                return Err(Error::InvalidTaskStatus {
                    verb: "start",
                    index,
                    status: other.status_name().to_string(),
                })
            }
        };
        *task = TaskRecord::Running {
            started_at: Utc::now(),
            context: context.to_string(),
            agent_session_id,
            retry_count,
        };
        Ok(())
    }

    /// Claim the first pending task. `None` unless running with a pending task.
    pub fn claim_next(&mut self, context: &str) -> Result<Option<usize>> {
        if !self.status.is_running() {
            return Ok(None);
        }
        let Some(index) = self.next_pending() else {
            return Ok(None);
        };
        self.start_task(index, context, None)?;
        Ok(Some(index))
    }

    /// Record the agent session serving a running task.
    pub fn attach_task_session(&mut self, index: usize, session_id: &str) -> Result<()> {
        let task = self.task_mut(index)?;
        match task {
            TaskRecord::Running {
                agent_session_id, ..
            } => {
                *agent_session_id = Some(session_id.to_string());
                Ok(())
            }
            other => Err(Error::InvalidTaskStatus {
                verb: "attach a session to",
                index,
                status: other.status_name().to_string(),
            }),
        }
    }

    fn running_retry_count(&mut self, index: usize, verb: &'static str) -> Result<u32> {
        self.ensure_running(verb)?;
        match self.task_mut(index)? {
            TaskRecord::Running { retry_count, .. } => Ok(*retry_count),
            other => Err(Error::InvalidTaskStatus {
                verb,
                index,
                status: other.status_name().to_string(),
            }),
        }
    }

    pub fn complete_task(&mut self, index: usize, output: TaskOutput) -> Result<()> {
        let retry_count = self.running_retry_count(index, "complete")?;
        self.tasks[index] = TaskRecord::Completed {
            completed_at: Utc::now(),
            output,
            retry_count,
        };
        Ok(())
    }

    pub fn fail_task(&mut self, index: usize, error: &str) -> Result<()> {
        let retry_count = self.running_retry_count(index, "fail")?;
        self.tasks[index] = TaskRecord::Failed {
            failed_at: Utc::now(),
            error: error.to_string(),
            retry_count,
        };
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.ensure_running("complete")?;
        if self.tasks.iter().any(|t| !t.is_completed()) {
            return Err(Error::IncompleteTasks);
        }
        self.status = ExecutionStatus::Completed {
            completed_at: Utc::now(),
        };
        Ok(())
    }

    pub fn fail(
        &mut self,
        error: &str,
        failed_step: usize,
        user_stop_reason: Option<String>,
    ) -> Result<()> {
        self.ensure_running("fail")?;
        if failed_step >= self.tasks.len() {
            return Err(Error::step_out_of_range(failed_step, self.tasks.len()));
        }
        self.status = ExecutionStatus::Failed {
            failed_at: Utc::now(),
            error: error.to_string(),
            failed_step,
            user_stop_reason,
        };
        Ok(())
    }

    pub fn stop(&mut self, reason: &str) -> Result<()> {
        self.ensure_running("stop")?;
        self.status = ExecutionStatus::Stopped {
            stopped_at: Utc::now(),
            reason: reason.to_string(),
        };
        Ok(())
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id.clone(),
            plan_id: self.plan_id.clone(),
            created_at: self.created_at,
            status: self.status.name().to_string(),
            completed_tasks: self.completed_count(),
            total_tasks: self.tasks.len(),
        }
    }
}

/// Lightweight listing entry for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub completed_tasks: usize,
    pub total_tasks: usize,
}

/// A task that has just been moved to running, with its plan step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub execution_id: String,
    pub plan_id: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub task: TaskRecord,
    pub step: PlanStep,
}

/// CRUD and stage transitions over persisted executions.
#[derive(Debug, Clone)]
pub struct ExecutionService {
    store: Store,
    logger: Logger,
}

impl ExecutionService {
    pub fn new(store: Store, logger: Logger) -> Self {
        Self { store, logger }
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        self.store
            .load_plan(plan_id)
            .await?
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))
    }

    /// Create a pending execution of an approved plan.
    pub async fn create(&self, plan_id: &str) -> Result<PlanExecution> {
        let plan = self.load_plan(plan_id).await?;
        let execution = PlanExecution::new(&plan)?;
        self.store.save_execution(&execution).await?;
        mlog!(
            self.logger,
            "Execution {} created for plan {} ({} tasks)",
            execution.execution_id,
            plan_id,
            execution.tasks.len()
        );
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<PlanExecution>> {
        self.store.find_execution(execution_id).await
    }

    pub async fn load(&self, execution_id: &str) -> Result<PlanExecution> {
        self.get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    /// Load, mutate and write back one execution. Nothing is written when
    /// `apply` fails.
    async fn update<T, F>(&self, execution_id: &str, apply: F) -> Result<(PlanExecution, T)>
    where
        F: FnOnce(&mut PlanExecution) -> Result<T>,
    {
        let mut execution = self.load(execution_id).await?;
        let value = apply(&mut execution)?;
        self.store.save_execution(&execution).await?;
        Ok((execution, value))
    }

    pub async fn start(&self, execution_id: &str) -> Result<PlanExecution> {
        let (execution, ()) = self.update(execution_id, |e| e.start()).await?;
        mlog!(self.logger, "Execution {} running", execution_id);
        Ok(execution)
    }

    fn claimed(plan: &Plan, execution: &PlanExecution, step_index: usize) -> Result<ClaimedTask> {
        let step = plan
            .steps
            .get(step_index)
            .cloned()
            .ok_or_else(|| Error::step_out_of_range(step_index, plan.steps.len()))?;
        Ok(ClaimedTask {
            execution_id: execution.execution_id.clone(),
            plan_id: execution.plan_id.clone(),
            step_index,
            total_steps: execution.tasks.len(),
            task: execution.tasks[step_index].clone(),
            step,
        })
    }

    /// Claim the lowest-index pending task. Assumes a single writer: two
    /// concurrent claims may return the same task.
    pub async fn claim_next_task(
        &self,
        execution_id: &str,
        context: &str,
    ) -> Result<Option<ClaimedTask>> {
        let mut execution = self.load(execution_id).await?;
        let plan = self.load_plan(&execution.plan_id).await?;
        let Some(index) = execution.claim_next(context)? else {
            mlog_debug!(self.logger, "Execution {} has nothing to claim", execution_id);
            return Ok(None);
        };
        let claimed = Self::claimed(&plan, &execution, index)?;
        self.store.save_execution(&execution).await?;
        mlog_debug!(self.logger, "Execution {} claimed task {}", execution_id, index);
        Ok(Some(claimed))
    }

    pub async fn start_task(
        &self,
        execution_id: &str,
        step_index: usize,
        context: &str,
        agent_session_id: Option<String>,
    ) -> Result<ClaimedTask> {
        let mut execution = self.load(execution_id).await?;
        let plan = self.load_plan(&execution.plan_id).await?;
        execution.start_task(step_index, context, agent_session_id)?;
        let claimed = Self::claimed(&plan, &execution, step_index)?;
        self.store.save_execution(&execution).await?;
        mlog_debug!(
            self.logger,
            "Execution {} started task {} (retry {})",
            execution_id,
            step_index,
            claimed.task.retry_count()
        );
        Ok(claimed)
    }

    pub async fn attach_task_session(
        &self,
        execution_id: &str,
        step_index: usize,
        session_id: &str,
    ) -> Result<PlanExecution> {
        let (execution, ()) = self
            .update(execution_id, |e| e.attach_task_session(step_index, session_id))
            .await?;
        Ok(execution)
    }

    pub async fn complete_task(
        &self,
        execution_id: &str,
        step_index: usize,
        output: TaskOutput,
    ) -> Result<PlanExecution> {
        let (execution, ()) = self
            .update(execution_id, |e| e.complete_task(step_index, output))
            .await?;
        mlog_debug!(self.logger, "Execution {} completed task {}", execution_id, step_index);
        Ok(execution)
    }

    pub async fn fail_task(
        &self,
        execution_id: &str,
        step_index: usize,
        error: &str,
    ) -> Result<PlanExecution> {
        let (execution, ()) = self
            .update(execution_id, |e| e.fail_task(step_index, error))
            .await?;
        mlog_debug!(
            self.logger,
            "Execution {} failed task {}: {}",
            execution_id,
            step_index,
            error
        );
        Ok(execution)
    }

    pub async fn complete(&self, execution_id: &str) -> Result<PlanExecution> {
        let (execution, ()) = self.update(execution_id, |e| e.complete()).await?;
        mlog!(self.logger, "Execution {} completed", execution_id);
        Ok(execution)
    }

    pub async fn fail(
        &self,
        execution_id: &str,
        error: &str,
        failed_step: usize,
        user_stop_reason: Option<String>,
    ) -> Result<PlanExecution> {
        let (execution, ()) = self
            .update(execution_id, |e| e.fail(error, failed_step, user_stop_reason))
            .await?;
        mlog!(
            self.logger,
            "Execution {} failed at step {}: {}",
            execution_id,
            failed_step,
            error
        );
        Ok(execution)
    }

    pub async fn stop(&self, execution_id: &str, reason: &str) -> Result<PlanExecution> {
        let (execution, ()) = self.update(execution_id, |e| e.stop(reason)).await?;
        mlog!(self.logger, "Execution {} stopped: {}", execution_id, reason);
        Ok(execution)
    }

    /// Most recent execution of a plan (largest id).
    pub async fn latest_execution(&self, plan_id: &str) -> Result<Option<PlanExecution>> {
        let ids = self.store.execution_ids(plan_id).await?;
        match ids.into_iter().max() {
            Some(id) => self.store.load_execution(plan_id, &id).await,
            None => Ok(None),
        }
    }

    /// Summaries of a plan's executions, newest first.
    pub async fn list_executions(&self, plan_id: &str) -> Result<Vec<ExecutionSummary>> {
        let mut ids = self.store.execution_ids(plan_id).await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.store.load_execution(plan_id, &id).await? {
                summaries.push(execution.summary());
            }
        }
        Ok(summaries)
    }
}
