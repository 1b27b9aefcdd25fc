//! Execution and task state over persisted documents.

use tokio_test::{assert_err, assert_ok};

use maestro::execution::TaskOutput;
use maestro::{Error, ExecutionStatus, TaskRecord};

use crate::fixtures::{content, Harness};

fn output(summary: &str) -> TaskOutput {
    TaskOutput {
        summary: summary.to_string(),
        artifacts: vec![],
        raw_response: "{}".to_string(),
    }
}

/// Test: Executions need an approved plan
#[tokio::test]
async fn test_create_on_proposal_fails() {
    let harness = Harness::new();
    let plan = harness
        .planning
        .create_proposal("ses_1", content(&[("Write code", "coder")]))
        .await
        .unwrap();

    let err = assert_err!(harness.executions.create(&plan.plan_id).await);
    assert_eq!(err.to_string(), "Cannot execute plan in stage: proposal");
    assert!(harness.executions.list_executions(&plan.plan_id).await.unwrap().is_empty());
}

/// Test: Unknown plans are reported by id
#[tokio::test]
async fn test_create_on_missing_plan() {
    let harness = Harness::new();
    let err = assert_err!(harness.executions.create("plan_missing").await);
    assert!(matches!(err, Error::PlanNotFound(ref id) if id == "plan_missing"));
}

/// Test: Tasks are index-aligned with plan steps
#[tokio::test]
async fn test_tasks_align_with_steps() {
    let harness = Harness::new();
    let plan = harness
        .approved_plan(&[("Write code", "coder"), ("Test it", "tester"), ("Review", "reviewer")])
        .await;
    let execution = harness.executions.create(&plan.plan_id).await.unwrap();
    assert_eq!(execution.tasks.len(), plan.steps.len());
    assert!(execution.tasks.iter().all(TaskRecord::is_pending));
    assert_eq!(execution.status, ExecutionStatus::Pending);

    harness.executions.start(&execution.execution_id).await.unwrap();
    for (i, step) in plan.steps.iter().enumerate() {
        let claimed = harness
            .executions
            .claim_next_task(&execution.execution_id, "ctx")
            .await
            .unwrap()
            .expect("a pending task");
        assert_eq!(claimed.step_index, i);
        assert_eq!(claimed.total_steps, plan.steps.len());
        assert_eq!(&claimed.step, step);
        harness
            .executions
            .complete_task(&execution.execution_id, i, output("done"))
            .await
            .unwrap();
    }
}

/// Test: Sequential claims
/// Given a running two-step execution
/// When a task is claimed, completed, then the next is claimed
/// Then the claims return step 0 and step 1 in turn
#[tokio::test]
async fn test_claims_walk_steps_in_order() {
    let harness = Harness::new();
    let plan = harness
        .approved_plan(&[("Write code", "coder"), ("Test it", "tester")])
        .await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();

    let first = harness.executions.claim_next_task(&id, "ctx").await.unwrap().unwrap();
    assert_eq!(first.step_index, 0);
    assert_eq!(first.task.status_name(), "running");
    harness.executions.complete_task(&id, 0, output("code written")).await.unwrap();

    let second = harness.executions.claim_next_task(&id, "ctx").await.unwrap().unwrap();
    assert_eq!(second.step_index, 1);
    assert_eq!(second.step.agent, "tester");
    harness.executions.complete_task(&id, 1, output("tests pass")).await.unwrap();

    assert!(harness.executions.claim_next_task(&id, "ctx").await.unwrap().is_none());
    let execution = assert_ok!(harness.executions.complete(&id).await);
    assert!(matches!(execution.status, ExecutionStatus::Completed { .. }));
}

/// Test: Claims on an execution that is not running return nothing
#[tokio::test]
async fn test_claim_before_start_is_none() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;

    assert!(harness.executions.claim_next_task(&id, "ctx").await.unwrap().is_none());
    let stored = harness.executions.load(&id).await.unwrap();
    assert!(stored.tasks[0].is_pending());
}

/// Test: Retry count tracks restarts
/// Given a task that fails and is restarted three times
/// Then its retry count is 3, and a task that never failed stays at 0
#[tokio::test]
async fn test_retry_count_after_restarts() {
    let harness = Harness::new();
    let plan = harness
        .approved_plan(&[("Flaky step", "coder"), ("Stable step", "tester")])
        .await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();
    harness.executions.claim_next_task(&id, "ctx").await.unwrap();

    for attempt in 0..3 {
        harness
            .executions
            .fail_task(&id, 0, &format!("attempt {} failed", attempt))
            .await
            .unwrap();
        let claimed = harness
            .executions
            .start_task(&id, 0, "retry", None)
            .await
            .unwrap();
        assert_eq!(claimed.task.retry_count(), attempt + 1);
    }
    let execution = harness
        .executions
        .complete_task(&id, 0, output("finally"))
        .await
        .unwrap();
    assert_eq!(execution.tasks[0].retry_count(), 3);

    let claimed = harness.executions.claim_next_task(&id, "ctx").await.unwrap().unwrap();
    assert_eq!(claimed.step_index, 1);
    assert_eq!(claimed.task.retry_count(), 0);
}

/// Test: A completed task cannot be restarted
#[tokio::test]
async fn test_restart_completed_task_rejected() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();
    harness.executions.claim_next_task(&id, "ctx").await.unwrap();
    harness.executions.complete_task(&id, 0, output("done")).await.unwrap();

    let err = assert_err!(harness.executions.start_task(&id, 0, "again", None).await);
    assert_eq!(err.to_string(), "Cannot start task 0 in status: completed");
    assert!(harness.executions.load(&id).await.unwrap().tasks[0].is_completed());
}

/// Test: Completing with unfinished tasks
#[tokio::test]
async fn test_complete_with_incomplete_tasks() {
    let harness = Harness::new();
    let plan = harness
        .approved_plan(&[("Write code", "coder"), ("Test it", "tester")])
        .await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();
    harness.executions.claim_next_task(&id, "ctx").await.unwrap();
    harness.executions.complete_task(&id, 0, output("done")).await.unwrap();

    let err = assert_err!(harness.executions.complete(&id).await);
    assert!(matches!(err, Error::IncompleteTasks));
    assert!(harness.executions.load(&id).await.unwrap().status.is_running());
}

/// Test: Failure records the step and stop reason
#[tokio::test]
async fn test_fail_execution_records_step() {
    let harness = Harness::new();
    let plan = harness
        .approved_plan(&[("Write code", "coder"), ("Test it", "tester")])
        .await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();

    harness
        .executions
        .fail(&id, "tester gave up", 1, Some("user said stop".into()))
        .await
        .unwrap();
    let stored = harness.executions.load(&id).await.unwrap();
    match stored.status {
        ExecutionStatus::Failed {
            error,
            failed_step,
            user_stop_reason,
            ..
        } => {
            assert_eq!(error, "tester gave up");
            assert_eq!(failed_step, 1);
            assert_eq!(user_stop_reason.as_deref(), Some("user said stop"));
        }
        other => panic!("expected failed, got {:?}", other),
    }

    let err = assert_err!(harness.executions.stop(&id, "late").await);
    assert_eq!(err.to_string(), "Cannot stop execution in stage: failed");
}

/// Test: Executions list newest first and latest is the newest
#[tokio::test]
async fn test_list_and_latest_executions() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;

    let first = harness.executions.create(&plan.plan_id).await.unwrap();
    let second = harness.executions.create(&plan.plan_id).await.unwrap();
    let third = harness.executions.create(&plan.plan_id).await.unwrap();
    harness.executions.start(&second.execution_id).await.unwrap();

    let listed: Vec<_> = harness
        .executions
        .list_executions(&plan.plan_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.execution_id, s.status))
        .collect();
    assert_eq!(
        listed,
        vec![
            (third.execution_id.clone(), "pending".to_string()),
            (second.execution_id.clone(), "running".to_string()),
            (first.execution_id.clone(), "pending".to_string()),
        ]
    );

    let latest = harness
        .executions
        .latest_execution(&plan.plan_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.execution_id, third.execution_id);
}

/// Test: Executions on disk live under their plan
#[tokio::test]
async fn test_execution_document_layout() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let execution = harness.executions.create(&plan.plan_id).await.unwrap();

    let path = harness
        .path
        .join(".opencode/plans")
        .join(&plan.plan_id)
        .join(format!("{}.json", execution.execution_id));
    let raw = std::fs::read_to_string(path).unwrap();
    assert!(raw.ends_with('\n'));
    assert!(raw.contains("\"stage\": \"pending\""));
    assert!(raw.contains("\"status\": \"pending\""));
}

/// Test: A claim that cannot resolve its step writes nothing
/// Given a running execution whose plan document has gone missing
/// When the next task is claimed
/// Then the claim fails and the stored task is still pending
#[tokio::test]
async fn test_claim_without_plan_leaves_task_pending() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();
    std::fs::remove_file(harness.store.plan_path(&plan.plan_id)).unwrap();

    let err = assert_err!(harness.executions.claim_next_task(&id, "ctx").await);
    assert!(matches!(err, Error::PlanNotFound(ref missing) if missing == &plan.plan_id));
    let err = assert_err!(harness.executions.start_task(&id, 0, "ctx", None).await);
    assert!(matches!(err, Error::PlanNotFound(_)));

    let stored = harness.executions.load(&id).await.unwrap();
    assert!(stored.tasks[0].is_pending());
}

/// Test: Failing at a step the execution does not have
#[tokio::test]
async fn test_fail_rejects_unknown_step() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let id = harness.executions.create(&plan.plan_id).await.unwrap().execution_id;
    harness.executions.start(&id).await.unwrap();

    let err = assert_err!(harness.executions.fail(&id, "boom", 5, None).await);
    assert_eq!(err.to_string(), "Step index 5 out of range (valid: 0..=0)");
    assert!(harness.executions.load(&id).await.unwrap().status.is_running());
}
