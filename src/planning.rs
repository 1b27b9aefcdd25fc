//! Planning service: persisted plan CRUD and stage transitions.
//!
//! Every operation loads the plan document, applies one transition from
//! [`Plan`] and writes the whole document back. A failed guard writes
//! nothing, so the persisted stage is unchanged.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::plan::{Plan, PlanContent, PlanStage, PlanStep};
use crate::store::Store;
use crate::{mlog, mlog_debug};

/// Lightweight listing entry for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub goal: String,
    pub stage: PlanStage,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub has_executions: bool,
}

#[derive(Debug, Clone)]
pub struct PlanningService {
    store: Store,
    logger: Logger,
}

impl PlanningService {
    pub fn new(store: Store, logger: Logger) -> Self {
        Self { store, logger }
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.store.load_plan(plan_id).await
    }

    pub async fn load(&self, plan_id: &str) -> Result<Plan> {
        self.get_plan(plan_id)
            .await?
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))
    }

    /// Expand a full id or unique id prefix to a stored plan id.
    pub async fn resolve_plan_id(&self, id_or_prefix: &str) -> Result<String> {
        let ids = self.store.plan_ids().await?;
        if ids.iter().any(|id| id == id_or_prefix) {
            return Ok(id_or_prefix.to_string());
        }
        let mut matches: Vec<String> = ids
            .into_iter()
            .filter(|id| id.starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Err(Error::PlanNotFound(id_or_prefix.to_string())),
            1 => Ok(matches.remove(0)),
            count => Err(Error::AmbiguousId {
                prefix: id_or_prefix.to_string(),
                count,
            }),
        }
    }

    async fn update<T, F>(&self, plan_id: &str, apply: F) -> Result<(Plan, T)>
    where
        F: FnOnce(&mut Plan) -> Result<T>,
    {
        let mut plan = self.load(plan_id).await?;
        let value = apply(&mut plan)?;
        self.store.save_plan(&plan).await?;
        Ok((plan, value))
    }

    pub async fn create_draft(&self, planner_session_id: &str, goal: &str) -> Result<Plan> {
        let plan = Plan::new_draft(planner_session_id, goal)?;
        self.store.save_plan(&plan).await?;
        mlog!(self.logger, "Plan {} created as draft", plan.plan_id);
        Ok(plan)
    }

    /// Persist a complete plan straight into the proposal stage.
    pub async fn create_proposal(
        &self,
        planner_session_id: &str,
        content: PlanContent,
    ) -> Result<Plan> {
        let plan = Plan::new_proposal(planner_session_id, content)?;
        self.store.save_plan(&plan).await?;
        mlog!(
            self.logger,
            "Plan {} created as proposal ({} steps)",
            plan.plan_id,
            plan.steps.len()
        );
        Ok(plan)
    }

    /// Append a step to a draft; returns the plan and the new step's index.
    pub async fn add_step(&self, plan_id: &str, step: PlanStep) -> Result<(Plan, usize)> {
        let (plan, index) = self.update(plan_id, |p| p.add_step(step)).await?;
        mlog_debug!(self.logger, "Plan {} step {} added", plan_id, index);
        Ok((plan, index))
    }

    pub async fn update_step(&self, plan_id: &str, index: usize, step: PlanStep) -> Result<Plan> {
        let (plan, ()) = self.update(plan_id, |p| p.update_step(index, step)).await?;
        mlog_debug!(self.logger, "Plan {} step {} updated", plan_id, index);
        Ok(plan)
    }

    pub async fn remove_step(&self, plan_id: &str, index: usize) -> Result<(Plan, PlanStep)> {
        let (plan, removed) = self.update(plan_id, |p| p.remove_step(index)).await?;
        mlog_debug!(self.logger, "Plan {} step {} removed", plan_id, index);
        Ok((plan, removed))
    }

    pub async fn set_goal(&self, plan_id: &str, goal: &str) -> Result<Plan> {
        Ok(self.update(plan_id, |p| p.set_goal(goal)).await?.0)
    }

    pub async fn set_summary(&self, plan_id: &str, summary: Option<String>) -> Result<Plan> {
        Ok(self.update(plan_id, |p| p.set_summary(summary)).await?.0)
    }

    pub async fn set_assumptions(&self, plan_id: &str, assumptions: Vec<String>) -> Result<Plan> {
        Ok(self
            .update(plan_id, |p| p.set_assumptions(assumptions))
            .await?
            .0)
    }

    pub async fn set_verification(&self, plan_id: &str, verification: Vec<String>) -> Result<Plan> {
        Ok(self
            .update(plan_id, |p| p.set_verification(verification))
            .await?
            .0)
    }

    pub async fn set_risks(&self, plan_id: &str, risks: Vec<String>) -> Result<Plan> {
        Ok(self.update(plan_id, |p| p.set_risks(risks)).await?.0)
    }

    /// Draft -> proposal, once every section is filled.
    pub async fn submit(&self, plan_id: &str) -> Result<Plan> {
        let (plan, ()) = self.update(plan_id, Plan::submit).await?;
        mlog!(self.logger, "Plan {} submitted for approval", plan_id);
        Ok(plan)
    }

    /// Replace a proposal's content; the plan stays a proposal.
    pub async fn revise(&self, plan_id: &str, content: PlanContent) -> Result<Plan> {
        let (plan, ()) = self.update(plan_id, |p| p.revise(content)).await?;
        mlog!(self.logger, "Plan {} revised", plan_id);
        Ok(plan)
    }

    pub async fn approve(&self, plan_id: &str) -> Result<Plan> {
        let (plan, ()) = self.update(plan_id, Plan::approve).await?;
        mlog!(self.logger, "Plan {} approved", plan_id);
        Ok(plan)
    }

    pub async fn reject(&self, plan_id: &str, reason: Option<String>) -> Result<Plan> {
        let (plan, ()) = self.update(plan_id, |p| p.reject(reason)).await?;
        mlog!(
            self.logger,
            "Plan {} rejected{}",
            plan_id,
            plan.rejection_reason
                .as_deref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default()
        );
        Ok(plan)
    }

    /// Summaries of every plan, newest first.
    pub async fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let mut ids = self.store.plan_ids().await?;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(plan) = self.store.load_plan(&id).await? else {
                continue;
            };
            let has_executions = !self.store.execution_ids(&id).await?.is_empty();
            summaries.push(PlanSummary {
                plan_id: plan.plan_id,
                goal: plan.goal,
                stage: plan.stage,
                step_count: plan.steps.len(),
                created_at: plan.created_at,
                has_executions,
            });
        }
        Ok(summaries)
    }

    /// Delete a plan and all of its executions. Returns `false` if it did not exist.
    pub async fn remove_plan(&self, plan_id: &str) -> Result<bool> {
        let removed = self.store.delete_plan(plan_id).await?;
        if removed {
            mlog!(self.logger, "Plan {} removed", plan_id);
        }
        Ok(removed)
    }
}
