//! End-to-end control flow.
//!
//! A user message goes to the planner; a plan reply becomes a persisted
//! proposal. Once the proposal is approved, [`Orchestrator::run_execution`]
//! claims steps one at a time, dispatches each to its specialist and records
//! the result. Supervision checkpoints and agent questions are put to the user
//! through [`HitlService`]. Guard errors from the planning and execution
//! services propagate unchanged.

use std::path::Path;
use std::sync::Arc;

use crate::agents::{AgentRegistry, PLANNER};
use crate::config::Settings;
use crate::dispatch::{DispatchContext, DispatchOutcome, DispatchService, TaskRequest};
use crate::envelope::{
    CheckpointEnvelope, FailureCode, MessageEnvelope, PlanContext, QuestionEnvelope,
};
use crate::error::{Error, Result};
use crate::execution::{ExecutionService, ExecutionStatus, PlanExecution, TaskOutput};
use crate::hitl::{HitlService, QuestionOutcome, UserQuestion};
use crate::log::Logger;
use crate::plan::{Plan, PlanContent};
use crate::planning::PlanningService;
use crate::runtime::{QuestionClient, SessionClient};
use crate::store::Store;
use crate::{mlog, mlog_debug, mlog_warn};

pub const APPROVE_LABEL: &str = "Approve";
pub const STOP_LABEL: &str = "Stop";

/// Result of routing a user message through the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanRequestOutcome {
    /// The planner produced a plan, now persisted as a proposal.
    Proposed(Plan),
    /// The planner asked something the user did not answer.
    Unanswered(QuestionEnvelope),
    /// Any other reply, including failures.
    Reply(MessageEnvelope),
}

/// What became of a question put to the user.
enum Relayed {
    Answer(String),
    Unanswered,
    Cancelled,
}

enum CheckpointDecision {
    Approve,
    Stop(String),
}

/// How one step ended.
enum StepResult {
    Completed,
    Failed { error: String, user_stop_reason: Option<String> },
    Stopped(String),
}

pub struct Orchestrator {
    dispatch: DispatchService,
    planning: PlanningService,
    executions: ExecutionService,
    hitl: Arc<HitlService>,
    max_clarifications: u32,
    logger: Logger,
}

impl Orchestrator {
    pub fn new(
        dispatch: DispatchService,
        planning: PlanningService,
        executions: ExecutionService,
        hitl: Arc<HitlService>,
        max_clarifications: u32,
        logger: Logger,
    ) -> Self {
        Self {
            dispatch,
            planning,
            executions,
            hitl,
            max_clarifications,
            logger,
        }
    }

    /// Wire every service for `workdir` from resolved settings.
    pub fn from_settings(
        workdir: &Path,
        settings: &Settings,
        sessions: Arc<dyn SessionClient>,
        questions: Arc<dyn QuestionClient>,
        logger: Logger,
    ) -> Self {
        let store = Store::new(workdir, logger.clone());
        let registry = Arc::new(AgentRegistry::resolve(settings, &logger));
        Self::new(
            DispatchService::new(
                sessions,
                registry,
                settings.default_supervised,
                logger.clone(),
            ),
            PlanningService::new(store.clone(), logger.clone()),
            ExecutionService::new(store, logger.clone()),
            Arc::new(HitlService::new(
                questions,
                settings.hitl_timeout(),
                logger.clone(),
            )),
            settings.max_clarifications,
            logger,
        )
    }

    pub fn planning(&self) -> &PlanningService {
        &self.planning
    }

    pub fn executions(&self) -> &ExecutionService {
        &self.executions
    }

    pub fn dispatch(&self) -> &DispatchService {
        &self.dispatch
    }

    /// Handle for routing external question replies.
    pub fn hitl(&self) -> Arc<HitlService> {
        self.hitl.clone()
    }

    fn hitl_session<'a>(ctx: &'a DispatchContext, agent_session: Option<&'a str>) -> &'a str {
        ctx.parent_session_id
            .as_deref()
            .or(agent_session)
            .unwrap_or_default()
    }

    /// Ask the user, giving up as soon as `ctx` is cancelled. `None` means
    /// cancelled; the pending question is withdrawn.
    async fn ask_user(
        &self,
        ctx: &DispatchContext,
        agent_session: Option<&str>,
        questions: Vec<UserQuestion>,
    ) -> Result<Option<QuestionOutcome>> {
        let session = Self::hitl_session(ctx, agent_session);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                mlog_warn!(self.logger, "Question in session {} abandoned: cancelled", session);
                Ok(None)
            }
            outcome = self.hitl.ask(session, questions) => outcome.map(Some),
        }
    }

    /// Put an agent's question to the user.
    async fn relay_question(
        &self,
        ctx: &DispatchContext,
        agent_session: Option<&str>,
        question: &QuestionEnvelope,
    ) -> Result<Relayed> {
        let mut text = question.question.clone();
        if let Some(context) = &question.context {
            text.push_str("\n\n");
            text.push_str(context);
        }
        let mut user_question = UserQuestion::new(&question.agent_id, &text);
        for option in &question.options {
            user_question = user_question.with_option(option, None);
        }
        Ok(
            match self.ask_user(ctx, agent_session, vec![user_question]).await? {
                Some(QuestionOutcome::Answered(answer)) => Relayed::Answer(answer.to_text()),
                Some(QuestionOutcome::Rejected | QuestionOutcome::TimedOut) => Relayed::Unanswered,
                None => Relayed::Cancelled,
            },
        )
    }

    /// Send a user message to the planner and persist any plan it returns.
    pub async fn plan_request(
        &self,
        ctx: &DispatchContext,
        message: &str,
    ) -> Result<PlanRequestOutcome> {
        let mut outcome = self
            .dispatch
            .dispatch_task(ctx, TaskRequest::new(PLANNER, message))
            .await;
        let mut clarifications = 0;

        loop {
            let DispatchOutcome { result, session_id } = outcome;
            match result {
                MessageEnvelope::Plan(envelope) => {
                    let planner_session = session_id
                        .or_else(|| ctx.parent_session_id.clone())
                        .unwrap_or_default();
                    return match self
                        .planning
                        .create_proposal(&planner_session, PlanContent::from(envelope))
                        .await
                    {
                        Ok(plan) => Ok(PlanRequestOutcome::Proposed(plan)),
                        Err(Error::InvalidPlan(reason)) => {
                            mlog_warn!(self.logger, "Planner returned an unusable plan: {}", reason);
                            Ok(PlanRequestOutcome::Reply(MessageEnvelope::failure(
                                FailureCode::ValidationError,
                                "Planner returned an incomplete plan",
                                Some(reason),
                            )))
                        }
                        Err(e) => Err(e),
                    };
                }
                MessageEnvelope::Question(question) if clarifications < self.max_clarifications => {
                    clarifications += 1;
                    let Some(session) = session_id else {
                        return Ok(PlanRequestOutcome::Reply(MessageEnvelope::Question(question)));
                    };
                    match self.relay_question(ctx, Some(&session), &question).await? {
                        Relayed::Answer(answer) => {
                            outcome = self.dispatch.send_answer(ctx, PLANNER, &session, &answer).await;
                        }
                        Relayed::Unanswered => return Ok(PlanRequestOutcome::Unanswered(question)),
                        Relayed::Cancelled => {
                            return Ok(PlanRequestOutcome::Reply(MessageEnvelope::failure(
                                FailureCode::Timeout,
                                "Planning was cancelled while waiting for the user",
                                None,
                            )))
                        }
                    }
                }
                other => return Ok(PlanRequestOutcome::Reply(other)),
            }
        }
    }

    async fn resolve_checkpoint(
        &self,
        ctx: &DispatchContext,
        checkpoint: &CheckpointEnvelope,
    ) -> Result<CheckpointDecision> {
        let question = UserQuestion::new("Checkpoint", &checkpoint.message)
            .with_option(APPROVE_LABEL, Some("Run this and every remaining step"))
            .with_option(STOP_LABEL, Some("Stop the execution"));
        let Some(outcome) = self.ask_user(ctx, None, vec![question]).await? else {
            return Ok(CheckpointDecision::Stop(format!(
                "Checkpoint for {} cancelled",
                checkpoint.target_agent
            )));
        };
        Ok(match outcome {
            QuestionOutcome::Answered(answer) if answer.first() == Some(APPROVE_LABEL) => {
                CheckpointDecision::Approve
            }
            QuestionOutcome::Answered(answer) => CheckpointDecision::Stop(format!(
                "Checkpoint for {} declined: {}",
                checkpoint.target_agent,
                answer.to_text()
            )),
            QuestionOutcome::Rejected => CheckpointDecision::Stop(format!(
                "Checkpoint for {} dismissed",
                checkpoint.target_agent
            )),
            QuestionOutcome::TimedOut => CheckpointDecision::Stop(format!(
                "Checkpoint for {} timed out",
                checkpoint.target_agent
            )),
        })
    }

    /// Dispatch one claimed step until it settles.
    async fn run_step(
        &self,
        ctx: &DispatchContext,
        execution_id: &str,
        mut request: TaskRequest,
        approved_remaining: &mut bool,
    ) -> Result<StepResult> {
        let step_index = request
            .plan_context
            .as_ref()
            .map(|c| c.step_index)
            .unwrap_or_default();
        let mut attached: Option<String> = None;
        let mut clarifications = 0;
        let mut outcome = self.dispatch.dispatch_task(ctx, request.clone()).await;

        loop {
            let DispatchOutcome { result, session_id } = outcome;
            if let Some(session) = &session_id {
                if attached.as_deref() != Some(session.as_str()) {
                    self.executions
                        .attach_task_session(execution_id, step_index, session)
                        .await?;
                    attached = Some(session.clone());
                    request.session_id = Some(session.clone());
                }
            }

            match result {
                MessageEnvelope::Checkpoint(checkpoint) => {
                    match self.resolve_checkpoint(ctx, &checkpoint).await? {
                        CheckpointDecision::Approve => {
                            mlog!(
                                self.logger,
                                "Execution {}: remaining steps approved at step {}",
                                execution_id,
                                step_index
                            );
                            *approved_remaining = true;
                            if let Some(c) = request.plan_context.as_mut() {
                                c.approved_remaining = true;
                            }
                            outcome = self.dispatch.dispatch_task(ctx, request.clone()).await;
                        }
                        CheckpointDecision::Stop(reason) => return Ok(StepResult::Stopped(reason)),
                    }
                }
                MessageEnvelope::Question(question) if clarifications < self.max_clarifications => {
                    clarifications += 1;
                    let Some(session) = session_id else {
                        return Ok(StepResult::Failed {
                            error: "Agent asked a question without a session".to_string(),
                            user_stop_reason: None,
                        });
                    };
                    match self.relay_question(ctx, Some(&session), &question).await? {
                        Relayed::Answer(answer) => {
                            outcome = self
                                .dispatch
                                .send_answer(ctx, &request.agent, &session, &answer)
                                .await;
                        }
                        Relayed::Unanswered => {
                            return Ok(StepResult::Failed {
                                error: format!("Question from {} was not answered", question.agent_id),
                                user_stop_reason: Some("question not answered".to_string()),
                            })
                        }
                        Relayed::Cancelled => {
                            return Ok(StepResult::Stopped(format!(
                                "Cancelled while {} waited for an answer",
                                question.agent_id
                            )))
                        }
                    }
                }
                MessageEnvelope::Success(success) => {
                    let raw_response = serde_json::to_string(&MessageEnvelope::Success(success.clone()))?;
                    self.executions
                        .complete_task(
                            execution_id,
                            step_index,
                            TaskOutput {
                                summary: success.summary,
                                artifacts: success.artifacts,
                                raw_response,
                            },
                        )
                        .await?;
                    return Ok(StepResult::Completed);
                }
                MessageEnvelope::Answer(answer) => {
                    let raw_response = serde_json::to_string(&MessageEnvelope::Answer(answer.clone()))?;
                    self.executions
                        .complete_task(
                            execution_id,
                            step_index,
                            TaskOutput {
                                summary: answer.content,
                                artifacts: Vec::new(),
                                raw_response,
                            },
                        )
                        .await?;
                    return Ok(StepResult::Completed);
                }
                MessageEnvelope::Failure(failure) => {
                    let mut error = format!("{}: {}", failure.code, failure.message);
                    if let Some(cause) = &failure.cause {
                        error.push_str(&format!(" ({})", cause));
                    }
                    return Ok(StepResult::Failed {
                        error,
                        user_stop_reason: None,
                    });
                }
                other => {
                    return Ok(StepResult::Failed {
                        error: format!("Unexpected {} envelope from {}", other.kind(), request.agent),
                        user_stop_reason: None,
                    })
                }
            }
        }
    }

    /// Drive an execution until every step is done or one step ends it.
    pub async fn run_execution(
        &self,
        ctx: &DispatchContext,
        execution_id: &str,
    ) -> Result<PlanExecution> {
        let mut execution = self.executions.load(execution_id).await?;
        if execution.status == ExecutionStatus::Pending {
            execution = self.executions.start(execution_id).await?;
        }
        let plan = self.planning.load(&execution.plan_id).await?;
        let context = format!("Plan goal: {}", plan.goal);
        let mut approved_remaining = false;

        while let Some(claimed) = self
            .executions
            .claim_next_task(execution_id, &context)
            .await?
        {
            mlog_debug!(
                self.logger,
                "Execution {}: step {}/{} -> {}",
                execution_id,
                claimed.step_index + 1,
                claimed.total_steps,
                claimed.step.agent
            );
            let request = TaskRequest {
                agent: claimed.step.agent.clone(),
                description: claimed.step.description.clone(),
                suggested_approach: claimed
                    .step
                    .verification
                    .as_ref()
                    .map(|v| format!("Verify by: {}", v)),
                session_id: None,
                plan_context: Some(PlanContext {
                    plan_id: claimed.plan_id.clone(),
                    step_index: claimed.step_index,
                    total_steps: claimed.total_steps,
                    approved_remaining,
                }),
            };

            match self
                .run_step(ctx, execution_id, request, &mut approved_remaining)
                .await?
            {
                StepResult::Completed => {}
                StepResult::Failed {
                    error,
                    user_stop_reason,
                } => {
                    self.executions
                        .fail_task(execution_id, claimed.step_index, &error)
                        .await?;
                    return self
                        .executions
                        .fail(execution_id, &error, claimed.step_index, user_stop_reason)
                        .await;
                }
                StepResult::Stopped(reason) => {
                    self.executions
                        .fail_task(execution_id, claimed.step_index, &reason)
                        .await?;
                    return self.executions.stop(execution_id, &reason).await;
                }
            }
        }

        let execution = self.executions.load(execution_id).await?;
        if !execution.status.is_running() {
            return Ok(execution);
        }
        self.executions.complete(execution_id).await
    }

    /// Create a new execution of an approved plan and run it.
    pub async fn execute_plan(&self, ctx: &DispatchContext, plan_id: &str) -> Result<PlanExecution> {
        let execution = self.executions.create(plan_id).await?;
        self.run_execution(ctx, &execution.execution_id).await
    }
}
