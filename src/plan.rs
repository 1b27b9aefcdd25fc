//! Plan data model and stage machine.
//!
//! A plan moves `draft -> proposal -> approved | rejected`. Drafts are edited
//! field by field; a submitted proposal can only be revised wholesale, approved
//! or rejected. Every guard error names the stage the plan is actually in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::PlanEnvelope;
use crate::error::{Error, Result};
use crate::ids::{self, IdKind};

/// Lifecycle position of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStage {
    #[default]
    Draft,
    Proposal,
    Approved,
    Rejected,
}

impl std::fmt::Display for PlanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStage::Draft => write!(f, "draft"),
            PlanStage::Proposal => write!(f, "proposal"),
            PlanStage::Approved => write!(f, "approved"),
            PlanStage::Rejected => write!(f, "rejected"),
        }
    }
}

/// One step of a plan, handled by a named specialist agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub description: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
}

impl PlanStep {
    pub fn new(description: &str, agent: &str) -> Self {
        Self {
            description: description.to_string(),
            agent: agent.to_string(),
            verification: None,
        }
    }

    pub fn with_verification(mut self, verification: &str) -> Self {
        self.verification = Some(verification.to_string());
        self
    }
}

/// Full plan body, used when a complete plan arrives in one piece.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlanContent {
    pub goal: String,
    pub summary: Option<String>,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
    pub verification: Vec<String>,
    pub risks: Vec<String>,
}

impl From<PlanEnvelope> for PlanContent {
    fn from(envelope: PlanEnvelope) -> Self {
        Self {
            goal: envelope.goal,
            summary: envelope.summary,
            steps: envelope.steps,
            assumptions: envelope.assumptions,
            verification: envelope.verification,
            risks: envelope.risks,
        }
    }
}

/// Names of the sections a proposal must fill, in display order.
fn missing_sections(
    steps: &[PlanStep],
    assumptions: &[String],
    verification: &[String],
    risks: &[String],
) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if steps.is_empty() {
        missing.push("steps");
    }
    if assumptions.is_empty() {
        missing.push("assumptions");
    }
    if verification.is_empty() {
        missing.push("verification");
    }
    if risks.is_empty() {
        missing.push("risks");
    }
    missing
}

fn require_goal(goal: &str) -> Result<()> {
    if goal.trim().is_empty() {
        return Err(Error::InvalidPlan("goal must not be empty".to_string()));
    }
    Ok(())
}

fn require_step(step: &PlanStep) -> Result<()> {
    if step.description.trim().is_empty() {
        return Err(Error::InvalidPlan(
            "step description must not be empty".to_string(),
        ));
    }
    if step.agent.trim().is_empty() {
        return Err(Error::InvalidPlan("step agent must not be empty".to_string()));
    }
    Ok(())
}

fn require_complete(content: &PlanContent) -> Result<()> {
    require_goal(&content.goal)?;
    for step in &content.steps {
        require_step(step)?;
    }
    let missing = missing_sections(
        &content.steps,
        &content.assumptions,
        &content.verification,
        &content.risks,
    );
    if !missing.is_empty() {
        return Err(Error::InvalidPlan(format!(
            "plan is incomplete, missing: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// A unit of work proposed for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub planner_session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage: PlanStage,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub verification: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Plan {
    /// Create an empty draft.
    pub fn new_draft(planner_session_id: &str, goal: &str) -> Result<Self> {
        require_goal(goal)?;
        let now = Utc::now();
        Ok(Self {
            plan_id: ids::generate_id(IdKind::Plan),
            planner_session_id: planner_session_id.to_string(),
            created_at: now,
            updated_at: now,
            stage: PlanStage::Draft,
            goal: goal.to_string(),
            summary: None,
            steps: Vec::new(),
            assumptions: Vec::new(),
            verification: Vec::new(),
            risks: Vec::new(),
            rejection_reason: None,
        })
    }

    /// Create a proposal directly from complete content.
    pub fn new_proposal(planner_session_id: &str, content: PlanContent) -> Result<Self> {
        require_complete(&content)?;
        let mut plan = Self::new_draft(planner_session_id, &content.goal)?;
        plan.apply_content(content);
        plan.stage = PlanStage::Proposal;
        Ok(plan)
    }

    fn apply_content(&mut self, content: PlanContent) {
        self.goal = content.goal;
        self.summary = content.summary;
        self.steps = content.steps;
        self.assumptions = content.assumptions;
        self.verification = content.verification;
        self.risks = content.risks;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn ensure_draft(&self) -> Result<()> {
        if self.stage != PlanStage::Draft {
            return Err(Error::PlanNotDraft {
                id: self.plan_id.clone(),
                stage: self.stage.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_stage(&self, expected: PlanStage, verb: &'static str) -> Result<()> {
        if self.stage != expected {
            return Err(Error::InvalidPlanStage {
                verb,
                stage: self.stage.to_string(),
            });
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.steps.len() {
            return Err(Error::step_out_of_range(index, self.steps.len()));
        }
        Ok(())
    }

    /// Append a step, returning its index.
    pub fn add_step(&mut self, step: PlanStep) -> Result<usize> {
        self.ensure_draft()?;
        require_step(&step)?;
        self.steps.push(step);
        self.touch();
        Ok(self.steps.len() - 1)
    }

    pub fn update_step(&mut self, index: usize, step: PlanStep) -> Result<()> {
        self.ensure_draft()?;
        self.check_index(index)?;
        require_step(&step)?;
        self.steps[index] = step;
        self.touch();
        Ok(())
    }

    pub fn remove_step(&mut self, index: usize) -> Result<PlanStep> {
        self.ensure_draft()?;
        self.check_index(index)?;
        let removed = self.steps.remove(index);
        self.touch();
        Ok(removed)
    }

    pub fn set_goal(&mut self, goal: &str) -> Result<()> {
        self.ensure_draft()?;
        require_goal(goal)?;
        self.goal = goal.to_string();
        self.touch();
        Ok(())
    }

    pub fn set_summary(&mut self, summary: Option<String>) -> Result<()> {
        self.ensure_draft()?;
        self.summary = summary;
        self.touch();
        Ok(())
    }

    pub fn set_assumptions(&mut self, assumptions: Vec<String>) -> Result<()> {
        self.ensure_draft()?;
        self.assumptions = assumptions;
        self.touch();
        Ok(())
    }

    pub fn set_verification(&mut self, verification: Vec<String>) -> Result<()> {
        self.ensure_draft()?;
        self.verification = verification;
        self.touch();
        Ok(())
    }

    pub fn set_risks(&mut self, risks: Vec<String>) -> Result<()> {
        self.ensure_draft()?;
        self.risks = risks;
        self.touch();
        Ok(())
    }

    /// Sections still empty; a proposal needs all of them filled.
    pub fn missing_sections(&self) -> Vec<&'static str> {
        missing_sections(&self.steps, &self.assumptions, &self.verification, &self.risks)
    }

    /// Move a complete draft to `proposal`.
    pub fn submit(&mut self) -> Result<()> {
        self.ensure_stage(PlanStage::Draft, "submit")?;
        let missing = self.missing_sections();
        if !missing.is_empty() {
            return Err(Error::InvalidPlan(format!(
                "plan is incomplete, missing: {}",
                missing.join(", ")
            )));
        }
        self.stage = PlanStage::Proposal;
        self.touch();
        Ok(())
    }

    /// Replace the whole body of a proposal; it stays a proposal.
    pub fn revise(&mut self, content: PlanContent) -> Result<()> {
        self.ensure_stage(PlanStage::Proposal, "revise")?;
        require_complete(&content)?;
        self.apply_content(content);
        self.touch();
        Ok(())
    }

    pub fn approve(&mut self) -> Result<()> {
        self.ensure_stage(PlanStage::Proposal, "approve")?;
        self.stage = PlanStage::Approved;
        self.touch();
        Ok(())
    }

    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        self.ensure_stage(PlanStage::Proposal, "reject")?;
        self.stage = PlanStage::Rejected;
        self.rejection_reason = reason;
        self.touch();
        Ok(())
    }

    /// Guard used before creating an execution.
    pub fn ensure_executable(&self) -> Result<()> {
        self.ensure_stage(PlanStage::Approved, "execute")
    }

    /// Render the plan for presenting to the user.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# Plan: {}\n\n", self.goal);
        out.push_str(&format!("_{} · {}_\n\n", self.plan_id, self.stage));
        if let Some(summary) = &self.summary {
            out.push_str(summary);
            out.push_str("\n\n");
        }
        out.push_str("## Steps\n\n");
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. **{}**: {}\n", i + 1, step.agent, step.description));
            if let Some(v) = &step.verification {
                out.push_str(&format!("   - verify: {}\n", v));
            }
        }
        for (title, items) in [
            ("Assumptions", &self.assumptions),
            ("Verification", &self.verification),
            ("Risks", &self.risks),
        ] {
            out.push_str(&format!("\n## {}\n\n", title));
            for item in items {
                out.push_str(&format!("- {}\n", item));
            }
        }
        if let Some(reason) = &self.rejection_reason {
            out.push_str(&format!("\n**Rejected:** {}\n", reason));
        }
        out
    }
}
