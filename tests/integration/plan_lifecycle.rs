//! Plan lifecycle integration tests.
//!
//! Every transition goes through the planning service, so each assertion
//! also covers what ends up on disk.

use tokio_test::{assert_err, assert_ok};

use maestro::plan::{PlanStage, PlanStep};
use maestro::Error;

use crate::fixtures::{content, Harness};

/// Test: Draft to proposal
/// Given a draft with one step and one entry per section
/// When it is submitted
/// Then it becomes a proposal
#[tokio::test]
async fn test_draft_fills_and_submits() {
    let harness = Harness::new();
    let planning = &harness.planning;

    let plan = assert_ok!(planning.create_draft("ses_1", "Ship feature X").await);
    let id = plan.plan_id;
    assert_ok!(planning.add_step(&id, PlanStep::new("Write code", "coder")).await);
    assert_ok!(planning.set_assumptions(&id, vec!["Repo builds".into()]).await);
    assert_ok!(planning.set_verification(&id, vec!["Tests pass".into()]).await);
    assert_ok!(planning.set_risks(&id, vec!["Scope creep".into()]).await);

    let plan = assert_ok!(planning.submit(&id).await);
    assert_eq!(plan.stage, PlanStage::Proposal);
}

/// Test: Incomplete drafts stay drafts
#[tokio::test]
async fn test_submit_without_steps_keeps_draft() {
    let harness = Harness::new();
    let planning = &harness.planning;
    let id = planning.create_draft("ses_1", "Ship").await.unwrap().plan_id;
    planning.set_assumptions(&id, vec!["a".into()]).await.unwrap();
    planning.set_verification(&id, vec!["v".into()]).await.unwrap();
    planning.set_risks(&id, vec!["r".into()]).await.unwrap();

    let err = assert_err!(planning.submit(&id).await);
    assert_eq!(err.to_string(), "Invalid plan: plan is incomplete, missing: steps");
    assert_eq!(planning.load(&id).await.unwrap().stage, PlanStage::Draft);
}

/// Test: Rejected plans cannot be approved
#[tokio::test]
async fn test_approve_rejected_plan() {
    let harness = Harness::new();
    let planning = &harness.planning;
    let id = planning
        .create_proposal("ses_1", content(&[("Write code", "coder")]))
        .await
        .unwrap()
        .plan_id;
    planning.reject(&id, None).await.unwrap();

    let err = assert_err!(planning.approve(&id).await);
    assert_eq!(err.to_string(), "Cannot approve plan in stage: rejected");
}

/// Test: Stage guard totality
/// Given a persisted plan in each stage
/// When any operation outside its legal stage runs
/// Then it errors and the stored stage is unchanged
#[tokio::test]
async fn test_illegal_transitions_leave_stage_unchanged() {
    let harness = Harness::new();
    let planning = &harness.planning;

    for stage in [
        PlanStage::Draft,
        PlanStage::Proposal,
        PlanStage::Approved,
        PlanStage::Rejected,
    ] {
        let id = match stage {
            PlanStage::Draft => planning.create_draft("ses_1", "Goal").await.unwrap().plan_id,
            _ => {
                let id = planning
                    .create_proposal("ses_1", content(&[("Write code", "coder")]))
                    .await
                    .unwrap()
                    .plan_id;
                match stage {
                    PlanStage::Approved => {
                        planning.approve(&id).await.unwrap();
                    }
                    PlanStage::Rejected => {
                        planning.reject(&id, Some("no".into())).await.unwrap();
                    }
                    _ => {}
                }
                id
            }
        };

        let mut attempts: Vec<(&str, Result<(), Error>)> = Vec::new();
        if stage != PlanStage::Draft {
            attempts.push(("submit", planning.submit(&id).await.map(drop)));
            attempts.push((
                "add_step",
                planning
                    .add_step(&id, PlanStep::new("x", "coder"))
                    .await
                    .map(drop),
            ));
            attempts.push(("set_risks", planning.set_risks(&id, vec![]).await.map(drop)));
            attempts.push(("set_goal", planning.set_goal(&id, "New").await.map(drop)));
        }
        if stage != PlanStage::Proposal {
            attempts.push((
                "revise",
                planning
                    .revise(&id, content(&[("y", "tester")]))
                    .await
                    .map(drop),
            ));
            attempts.push(("approve", planning.approve(&id).await.map(drop)));
            attempts.push(("reject", planning.reject(&id, None).await.map(drop)));
        }

        for (op, result) in attempts {
            let err = match result {
                Ok(()) => panic!("{} should fail in stage {}", op, stage),
                Err(e) => e.to_string(),
            };
            assert!(
                err.contains(&format!("stage: {}", stage)),
                "{} in {}: unexpected error {}",
                op,
                stage,
                err
            );
        }
        assert_eq!(planning.load(&id).await.unwrap().stage, stage);
    }
}

/// Test: Step index bounds
#[tokio::test]
async fn test_step_mutations_report_valid_range() {
    let harness = Harness::new();
    let planning = &harness.planning;
    let id = planning.create_draft("ses_1", "Goal").await.unwrap().plan_id;
    planning.add_step(&id, PlanStep::new("a", "coder")).await.unwrap();
    planning.add_step(&id, PlanStep::new("b", "tester")).await.unwrap();

    let err = assert_err!(planning.remove_step(&id, 2).await);
    assert_eq!(err.to_string(), "Step index 2 out of range (valid: 0..=1)");

    let (plan, removed) = assert_ok!(planning.remove_step(&id, 0).await);
    assert_eq!(removed.description, "a");
    assert_eq!(plan.steps[0].description, "b");
}

/// Test: Documents on disk
/// Plans are pretty-printed JSON with a trailing newline at the documented path.
#[tokio::test]
async fn test_plan_document_layout() {
    let harness = Harness::new();
    let plan = harness
        .planning
        .create_proposal("ses_1", content(&[("Write code", "coder")]))
        .await
        .unwrap();

    let path = harness
        .path
        .join(".opencode")
        .join("plans")
        .join(format!("{}.json", plan.plan_id));
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.ends_with("}\n"));
    assert!(raw.contains("\n  \"plan_id\""));
    assert!(raw.contains("\"stage\": \"proposal\""));
}

/// Test: Corrupt documents are hard errors naming the path
#[tokio::test]
async fn test_corrupt_plan_document() {
    let harness = Harness::new();
    let plans_dir = harness.store.plans_dir().to_path_buf();
    std::fs::create_dir_all(&plans_dir).unwrap();
    std::fs::write(plans_dir.join("plan_broken.json"), "{ not json").unwrap();

    let err = assert_err!(harness.planning.get_plan("plan_broken").await);
    assert!(matches!(err, Error::CorruptDocument { .. }));
    assert!(err.to_string().contains("plan_broken.json"));
}

/// Test: Removing a plan removes its executions
#[tokio::test]
async fn test_remove_plan_deletes_executions() {
    let harness = Harness::new();
    let plan = harness.approved_plan(&[("Write code", "coder")]).await;
    let execution = harness.executions.create(&plan.plan_id).await.unwrap();

    let summaries = harness.planning.list_plans().await.unwrap();
    assert!(summaries[0].has_executions);

    assert!(assert_ok!(harness.planning.remove_plan(&plan.plan_id).await));
    assert!(harness.planning.get_plan(&plan.plan_id).await.unwrap().is_none());
    assert!(harness
        .executions
        .get_execution(&execution.execution_id)
        .await
        .unwrap()
        .is_none());
    assert!(!harness.store.executions_dir(&plan.plan_id).exists());
}

/// Test: Markdown rendering for approval
#[tokio::test]
async fn test_proposal_markdown() {
    let harness = Harness::new();
    let plan = harness
        .planning
        .create_proposal("ses_1", content(&[("Write code", "coder"), ("Test", "tester")]))
        .await
        .unwrap();

    let markdown = plan.to_markdown();
    assert!(markdown.starts_with("# Plan: Ship feature X"));
    assert!(markdown.contains("1. **coder**: Write code"));
    assert!(markdown.contains("2. **tester**: Test"));
    assert!(markdown.contains("## Risks\n\n- Scope creep"));
}

/// Test: Ids cannot point outside the plan store
/// Given ids carrying path separators or parent references
/// When they are used to read or remove plans
/// Then each is rejected and nothing outside the store is touched
#[tokio::test]
async fn test_path_like_ids_rejected() {
    let harness = Harness::new();
    let outside = harness.path.join(".opencode").join("victim.json");
    std::fs::create_dir_all(outside.parent().unwrap()).unwrap();
    std::fs::write(&outside, "{}").unwrap();

    for id in ["../victim", "../../etc/passwd", "plans/../x", "a\\b"] {
        let err = assert_err!(harness.planning.get_plan(id).await);
        assert!(matches!(err, Error::InvalidId(ref bad) if bad == id), "{}: {}", id, err);
        assert_err!(harness.planning.remove_plan(id).await);
        assert_err!(harness.executions.create(id).await);
    }
    assert!(outside.exists());
}
