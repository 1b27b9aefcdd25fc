//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary working directory with every service wired to it
//! - Scripted agent replies in the envelope wire format
//! - Answering HITL questions from a background task

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use maestro::agents::AgentRegistry;
use maestro::dispatch::{DispatchContext, DispatchService};
use maestro::execution::ExecutionService;
use maestro::hitl::{HitlService, UserAnswer};
use maestro::plan::{Plan, PlanContent, PlanStep};
use maestro::runtime::ScriptedRuntime;
use maestro::{Logger, LogLevel, Orchestrator, PlanningService, Settings, Store};

pub const TS: &str = "2025-01-15T10:30:00Z";

/// A temporary working directory with services over it.
pub struct Harness {
    /// Keeps the directory alive for the test's duration.
    pub temp_dir: TempDir,
    pub path: PathBuf,
    pub runtime: Arc<ScriptedRuntime>,
    pub logger: Logger,
    pub store: Store,
    pub planning: PlanningService,
    pub executions: ExecutionService,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let logger = Logger::in_memory(LogLevel::Debug);
        let store = Store::new(&path, logger.clone());
        Self {
            planning: PlanningService::new(store.clone(), logger.clone()),
            executions: ExecutionService::new(store.clone(), logger.clone()),
            runtime: Arc::new(ScriptedRuntime::new()),
            temp_dir,
            path,
            logger,
            store,
        }
    }

    pub fn ctx(&self) -> DispatchContext {
        DispatchContext::new(&self.path).with_parent("ses_user")
    }

    pub fn dispatch(&self, settings: &Settings) -> DispatchService {
        DispatchService::new(
            self.runtime.clone(),
            Arc::new(AgentRegistry::resolve(settings, &self.logger)),
            settings.default_supervised,
            self.logger.clone(),
        )
    }

    pub fn hitl(&self, timeout: Duration) -> Arc<HitlService> {
        Arc::new(HitlService::new(
            self.runtime.clone(),
            timeout,
            self.logger.clone(),
        ))
    }

    pub fn orchestrator(&self, settings: &Settings) -> Orchestrator {
        Orchestrator::from_settings(
            &self.path,
            settings,
            self.runtime.clone(),
            self.runtime.clone(),
            self.logger.clone(),
        )
    }

    /// Persist an approved plan with one step per `(description, agent)`.
    pub async fn approved_plan(&self, steps: &[(&str, &str)]) -> Plan {
        let plan = self
            .planning
            .create_proposal("ses_planner", content(steps))
            .await
            .expect("Failed to create proposal");
        self.planning
            .approve(&plan.plan_id)
            .await
            .expect("Failed to approve plan")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete plan content with the given steps.
pub fn content(steps: &[(&str, &str)]) -> PlanContent {
    PlanContent {
        goal: "Ship feature X".to_string(),
        summary: Some("Two small changes".to_string()),
        steps: steps
            .iter()
            .map(|(description, agent)| PlanStep::new(description, agent))
            .collect(),
        assumptions: vec!["The repository builds".to_string()],
        verification: vec!["cargo test passes".to_string()],
        risks: vec!["Scope creep".to_string()],
    }
}

pub fn answer_json(agent: &str, content: &str) -> String {
    serde_json::json!({
        "type": "answer",
        "timestamp": TS,
        "agent_id": agent,
        "content": content,
    })
    .to_string()
}

pub fn success_json(agent: &str, summary: &str) -> String {
    serde_json::json!({
        "type": "success",
        "timestamp": TS,
        "agent_id": agent,
        "summary": summary,
        "artifacts": ["src/lib.rs"],
    })
    .to_string()
}

pub fn question_json(agent: &str, question: &str) -> String {
    serde_json::json!({
        "type": "question",
        "timestamp": TS,
        "agent_id": agent,
        "question": question,
    })
    .to_string()
}

pub fn plan_json(steps: &[(&str, &str)]) -> String {
    let steps: Vec<_> = steps
        .iter()
        .map(|(description, agent)| serde_json::json!({"description": description, "agent": agent}))
        .collect();
    serde_json::json!({
        "type": "plan",
        "timestamp": TS,
        "agent_id": "planner",
        "goal": "Ship feature X",
        "steps": steps,
        "assumptions": ["a"],
        "verification": ["v"],
        "risks": ["r"],
    })
    .to_string()
}

/// Reply to the next question put to `hitl` with `answer`.
pub async fn reply_when_asked(runtime: Arc<ScriptedRuntime>, hitl: Arc<HitlService>, answer: &str) {
    loop {
        if hitl.pending_count() > 0 {
            if let Some((id, _, _)) = runtime.questions().last().cloned() {
                if hitl.handle_question_replied(&id, UserAnswer::single(answer)) {
                    return;
                }
            }
        }
        tokio::task::yield_now().await;
    }
}

/// Wait until `count` questions are pending on `hitl`.
pub async fn wait_for_pending(hitl: &HitlService, count: usize) {
    while hitl.pending_count() < count {
        tokio::task::yield_now().await;
    }
}
