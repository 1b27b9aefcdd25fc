//! Dispatch, supervision gate and response validation.

use maestro::config::AgentOverride;
use maestro::envelope::{
    AnswerEnvelope, CheckpointEnvelope, FailureEnvelope, InterruptEnvelope, PlanContext,
    PlanEnvelope, QuestionEnvelope, SuccessEnvelope, TaskEnvelope, Timestamp,
};
use maestro::ids::{self, IdKind};
use maestro::runtime::extract_text;
use maestro::validator::{validate_response, ResponseError};
use maestro::{FailureCode, MessageEnvelope, PlanStep, QuestionRequest, Settings, TaskRequest};

use crate::fixtures::{answer_json, success_json, Harness, TS};

fn supervised_coder() -> Settings {
    let mut settings = Settings::default();
    settings.agents.insert(
        "coder".to_string(),
        AgentOverride {
            supervised: Some(true),
            ..Default::default()
        },
    );
    settings
}

fn plan_context(approved_remaining: bool) -> PlanContext {
    PlanContext {
        plan_id: "plan_018f3a2b4c5dXk3Lp9QzR2mW7a".to_string(),
        step_index: 0,
        total_steps: 2,
        approved_remaining,
    }
}

/// Test: Supervision gate
/// Given a supervised coder
/// When a task is dispatched without approval
/// Then a checkpoint comes back and the agent is never prompted
/// And the same task with approval reaches the agent
#[tokio::test]
async fn test_supervised_dispatch_needs_approval() {
    let harness = Harness::new();
    let dispatch = harness.dispatch(&supervised_coder());

    let mut request = TaskRequest::new("coder", "Write code");
    request.plan_context = Some(plan_context(false));
    let outcome = dispatch.dispatch_task(&harness.ctx(), request.clone()).await;
    match &outcome.result {
        MessageEnvelope::Checkpoint(checkpoint) => {
            assert_eq!(checkpoint.target_agent, "coder");
            assert_eq!(checkpoint.step_index, Some(0));
        }
        other => panic!("expected checkpoint, got {:?}", other),
    }
    assert!(harness.runtime.prompts().is_empty());
    assert_eq!(harness.runtime.session_count(), 0);

    harness
        .runtime
        .push_text("coder", &success_json("coder", "Code written"));
    request.plan_context = Some(plan_context(true));
    let outcome = dispatch.dispatch_task(&harness.ctx(), request).await;
    assert_eq!(outcome.result.kind(), "success");
    assert!(outcome.session_id.is_some());

    let prompts = harness.runtime.prompts_for("coder");
    assert_eq!(prompts.len(), 1);
    assert!(extract_text(&prompts[0].parts).contains("Step 1 of 2 in plan"));
}

/// Test: Unsupervised agents run straight away
#[tokio::test]
async fn test_unsupervised_dispatch_runs() {
    let harness = Harness::new();
    let dispatch = harness.dispatch(&supervised_coder());
    harness
        .runtime
        .push_text("tester", &answer_json("tester", "All green"));

    let outcome = dispatch
        .dispatch_task(&harness.ctx(), TaskRequest::new("tester", "Run tests"))
        .await;
    let MessageEnvelope::Answer(answer) = &outcome.result else {
        panic!("expected answer, got {:?}", outcome.result);
    };
    assert_eq!(answer.content, "All green");
    assert_eq!(harness.runtime.session_count(), 1);
}

/// Test: Questions to a supervised agent are not gated
#[tokio::test]
async fn test_question_to_supervised_agent() {
    let harness = Harness::new();
    let dispatch = harness.dispatch(&supervised_coder());
    harness
        .runtime
        .push_text("coder", &answer_json("coder", "Use a BTreeMap"));

    let outcome = dispatch
        .dispatch_question(
            &harness.ctx(),
            QuestionRequest {
                agent: "coder".into(),
                question: "Which map type?".into(),
                context: Some("Ordering matters".into()),
                session_id: None,
            },
        )
        .await;
    assert_eq!(outcome.result.kind(), "answer");
    let prompt = extract_text(&harness.runtime.prompts_for("coder")[0].parts);
    assert_eq!(prompt, "## Question\n\nWhich map type?\n\n### Context\n\nOrdering matters");
}

/// Test: Disabled agents are unknown to dispatch
#[tokio::test]
async fn test_disabled_agent_is_unknown() {
    let harness = Harness::new();
    let mut settings = Settings::default();
    settings.agents.insert(
        "researcher".to_string(),
        AgentOverride {
            disabled: Some(true),
            ..Default::default()
        },
    );
    let dispatch = harness.dispatch(&settings);

    let outcome = dispatch
        .dispatch_task(&harness.ctx(), TaskRequest::new("researcher", "Look around"))
        .await;
    let MessageEnvelope::Failure(failure) = outcome.result else {
        panic!("expected failure");
    };
    assert_eq!(failure.code, FailureCode::UnknownAgent);
    assert_eq!(
        failure.message,
        "Unknown agent: researcher. Available agents: coder, planner, reviewer, tester"
    );
    assert!(outcome.session_id.is_none());
}

/// Test: Invalid replies are corrected on the same session
#[tokio::test]
async fn test_invalid_reply_corrected_in_session() {
    let harness = Harness::new();
    let dispatch = harness.dispatch(&Settings::default());
    harness
        .runtime
        .push_text("coder", r#"{"type": "answer", "agent_id": "coder"}"#);
    harness
        .runtime
        .push_text("coder", &format!("```json\n{}\n```", answer_json("coder", "Fixed")));

    let outcome = dispatch
        .dispatch_task(&harness.ctx(), TaskRequest::new("coder", "Write code"))
        .await;
    assert_eq!(outcome.result.kind(), "answer");

    let prompts = harness.runtime.prompts_for("coder");
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0].session_id, prompts[1].session_id);
    let correction = extract_text(&prompts[1].parts);
    assert!(correction.starts_with("Your previous response was not a valid message envelope."));
    assert!(correction.contains("- timestamp: "));
    assert!(correction.contains("- content: "));
    assert!(harness
        .logger
        .lines()
        .iter()
        .any(|line| line.starts_with("[WARN] Invalid response from coder (retry 1/2)")));
}

/// Test: Exhausted retries fail with the last problem as cause
#[tokio::test]
async fn test_exhausted_retries_fail_validation() {
    let harness = Harness::new();
    let mut settings = Settings::default();
    settings.max_retries = 1;
    let dispatch = harness.dispatch(&settings);
    harness.runtime.push_text("coder", "{ nope");
    harness.runtime.push_text("coder", "{ still nope");

    let outcome = dispatch
        .dispatch_task(&harness.ctx(), TaskRequest::new("coder", "Write code"))
        .await;
    let MessageEnvelope::Failure(failure) = outcome.result else {
        panic!("expected failure");
    };
    assert_eq!(failure.code, FailureCode::ValidationError);
    assert_eq!(
        failure.message,
        "Response from agent coder failed validation after 2 attempt(s)"
    );
    assert!(failure.cause.unwrap().starts_with("Invalid JSON: "));
}

fn sample_envelopes() -> Vec<MessageEnvelope> {
    let timestamp = Timestamp::parse(TS).unwrap();
    let session_id = ids::generate_id(IdKind::Session);
    vec![
        MessageEnvelope::Task(TaskEnvelope {
            session_id: session_id.clone(),
            timestamp,
            agent_id: "coder".into(),
            description: "Write code".into(),
            suggested_approach: Some("Small steps".into()),
            plan_context: Some(plan_context(true)),
        }),
        MessageEnvelope::Interrupt(InterruptEnvelope {
            session_id,
            timestamp,
            agent_id: "coder".into(),
            reason: "User changed their mind".into(),
        }),
        MessageEnvelope::Answer(AnswerEnvelope {
            timestamp,
            agent_id: "researcher".into(),
            content: "It uses tokio".into(),
        }),
        MessageEnvelope::Question(QuestionEnvelope {
            timestamp,
            agent_id: "coder".into(),
            question: "Which crate?".into(),
            options: vec!["serde".into(), "miniserde".into()],
            context: None,
        }),
        MessageEnvelope::Success(SuccessEnvelope {
            timestamp,
            agent_id: "coder".into(),
            summary: "Done".into(),
            artifacts: vec!["src/lib.rs".into()],
        }),
        MessageEnvelope::Plan(PlanEnvelope {
            timestamp,
            agent_id: "planner".into(),
            goal: "Ship feature X".into(),
            summary: None,
            steps: vec![PlanStep::new("Write code", "coder").with_verification("cargo test")],
            assumptions: vec!["a".into()],
            verification: vec!["v".into()],
            risks: vec!["r".into()],
        }),
        MessageEnvelope::Checkpoint(CheckpointEnvelope {
            timestamp,
            agent_id: "orchestrator".into(),
            message: "Approve?".into(),
            target_agent: "coder".into(),
            plan_id: Some("plan_1".into()),
            step_index: Some(1),
        }),
        MessageEnvelope::Failure(FailureEnvelope {
            timestamp,
            code: FailureCode::Timeout,
            message: "Took too long".into(),
            cause: Some("cancelled".into()),
        }),
    ]
}

/// Test: Serialized envelopes validate back to themselves
#[test]
fn test_envelopes_survive_validation() {
    for envelope in sample_envelopes() {
        let raw = serde_json::to_string(&envelope).unwrap();
        let decoded = validate_response(&raw, "coder", false)
            .unwrap_or_else(|e| panic!("{} did not validate: {}", envelope.kind(), e.detail()));
        assert_eq!(decoded, envelope);
    }
}

/// Test: Unknown fields are rejected for every envelope type
#[test]
fn test_extra_field_rejected() {
    for envelope in sample_envelopes() {
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["extra"] = serde_json::json!(true);
        let err = validate_response(&value.to_string(), "coder", true).unwrap_err();
        assert!(
            matches!(&err, ResponseError::Schema(issues) if issues.iter().any(|i| i.path == "extra")),
            "{}: {:?}",
            envelope.kind(),
            err
        );
    }
}

/// Test: Plain-text wrapping is stable
/// Given non-JSON text wrapped as an answer
/// When the wrapped answer is validated again
/// Then the content is unchanged
#[test]
fn test_plain_text_wrap_is_idempotent() {
    for text in ["Done, see src/lib.rs", "  padded\nmulti-line  ", "¿Qué tal? ✓"] {
        let wrapped = validate_response(text, "coder", true).unwrap();
        let MessageEnvelope::Answer(answer) = &wrapped else {
            panic!("expected answer for {:?}", text);
        };
        assert_eq!(answer.content, text);

        let again = validate_response(&serde_json::to_string(&wrapped).unwrap(), "coder", true)
            .unwrap();
        assert_eq!(again, wrapped);
    }
}
