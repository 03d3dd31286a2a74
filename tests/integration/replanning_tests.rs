use super::common::*;
use planwright::approval::{AutoApprove, PendingApprovals};
use planwright::classifier::{ErrorCategory, Severity};
use planwright::persistence::PlanStore;
use planwright::planning::{PlanEvent, PlanStatus, StepStatus, Task, TaskStatus};
use planwright::{EngineError, InterventionAction};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn abc() -> ScriptedDecomposer {
    ScriptedDecomposer::new(vec![
        body(
            "ship",
            vec![action("a", &[]), action("b", &["a"]), action("c", &["a"])],
        ),
        body(
            "ship without b",
            vec![action("a", &[]), action("b2", &["a"]), action("c", &["a"])],
        ),
    ])
}

#[tokio::test]
async fn test_critical_failure_replans_and_carries_completed_steps() {
    let mut harness = Harness::new(
        fast_config(),
        abc(),
        ScriptedActor::new().failing("b", "Permission denied writing /srv/out"),
        Arc::new(AutoApprove),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-abc", "ship it"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.replan_attempts, 1);
    assert_eq!(task.consecutive_failures, 0);
    assert_eq!(task.failure_history.len(), 1);
    assert_eq!(task.failure_history[0].step_id.as_deref(), Some("b"));

    let versions = harness.store.plan_versions("task-abc").await.unwrap();
    assert_eq!(versions.len(), 2);
    let (v1, v2) = (&versions[0], &versions[1]);

    assert_eq!(v1.status, PlanStatus::Failed);
    assert_eq!(v1.step("b").unwrap().status, StepStatus::Failed);
    // the plan stopped at the fatal failure
    assert_eq!(v1.step("c").unwrap().status, StepStatus::Pending);

    assert_eq!(v2.version, 2);
    assert_eq!(v2.parent_plan_id.as_deref(), Some(v1.id.as_str()));
    assert_eq!(v2.status, PlanStatus::Completed);
    let analysis = &v2.context["error_analysis"];
    assert_eq!(analysis["severity"], json!("CRITICAL"));
    assert_eq!(analysis["category"], json!("ENVIRONMENT"));
    assert!(analysis["message"]
        .as_str()
        .unwrap()
        .contains("Permission denied"));
    assert_eq!(v2.context["previous_plan"]["version"], json!(1));

    let a = v2.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Completed);
    assert_eq!(a.result, Some(json!({"step": "a"})));

    // a ran once, in v1 only
    assert_eq!(harness.actor.invocations("a"), 1);
    assert_eq!(harness.actor.invocations("b"), 1);
    assert_eq!(harness.actor.invocations("b2"), 1);
    assert_eq!(harness.actor.invocations("c"), 1);

    let calls = harness.decomposer.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].replan.is_none());
    let replan = calls[1].replan.as_ref().unwrap();
    assert_eq!(replan.attempt, 1);
    assert_eq!(replan.error.severity, Severity::Critical);
    assert_eq!(replan.previous_plan_id, v1.id);
    let carried: Vec<&str> = replan.completed_steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(carried, vec!["a"]);

    let events = harness.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, PlanEvent::ReplanTriggered { attempt: 1, .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PlanEvent::PlanCreated { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn test_low_severity_failure_fails_task_without_replanning() {
    let harness = Harness::new(
        fast_config(),
        ScriptedDecomposer::new(vec![body("check", vec![action("x", &[])])]),
        ScriptedActor::new().failing("x", "checksum mismatch"),
        Arc::new(AutoApprove),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-low", "check"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.replan_attempts, 0);
    assert_eq!(task.failure_history[0].severity, Severity::Low);
    assert_eq!(task.failure_history[0].category, ErrorCategory::Unknown);

    let versions = harness.store.plan_versions("task-low").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, PlanStatus::Failed);
    assert_eq!(harness.decomposer.calls().len(), 1);
}

fn always_failing_x(max_attempts: u32) -> Harness {
    let mut config = fast_config();
    config.replanning.max_attempts = max_attempts;
    Harness::new(
        config,
        ScriptedDecomposer::new(vec![body("reach", vec![action("x", &[])])]),
        ScriptedActor::new().failing("x", "Connection refused (os error 111)"),
        Arc::new(AutoApprove),
    )
}

#[tokio::test]
async fn test_exhausted_attempts_escalate_then_abandon() {
    let mut harness = always_failing_x(2);

    let err = harness
        .coordinator
        .submit_task(Task::new("task-esc", "reach the service"))
        .await
        .unwrap_err();
    match &err {
        EngineError::RequiresHumanIntervention {
            task_id,
            reason,
            last_error,
        } => {
            assert_eq!(task_id, "task-esc");
            assert!(reason.contains("attempts exhausted"));
            assert_eq!(last_error.as_ref().unwrap().severity, Severity::High);
        }
        other => panic!("expected escalation, got {:?}", other),
    }
    assert!(err.requires_human());

    let task = harness.store.require_task("task-esc").await.unwrap();
    assert_eq!(task.status, TaskStatus::RequiresHuman);
    assert_eq!(task.replan_attempts, 2);
    assert!(task.intervention_reason.is_some());

    let versions = harness.store.plan_versions("task-esc").await.unwrap();
    let numbers: Vec<u32> = versions.iter().map(|p| p.version).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    for pair in versions.windows(2) {
        assert_eq!(pair[1].parent_plan_id.as_deref(), Some(pair[0].id.as_str()));
    }
    assert!(versions.iter().all(|p| p.status == PlanStatus::Failed));

    assert!(harness
        .drain_events()
        .iter()
        .any(|e| matches!(e, PlanEvent::HumanInterventionRequired { .. })));

    let task = harness
        .coordinator
        .resolve_intervention("task-esc", InterventionAction::Abandon)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // Nothing left to resolve
    assert!(harness
        .coordinator
        .resolve_intervention("task-esc", InterventionAction::Retry)
        .await
        .is_err());
}

#[tokio::test]
async fn test_retry_after_escalation_forces_approval() {
    let harness = always_failing_x(1);

    let err = harness
        .coordinator
        .submit_task(Task::new("task-retry", "reach the service"))
        .await
        .unwrap_err();
    assert!(err.requires_human());

    harness.actor.heal("x");
    let task = harness
        .coordinator
        .resolve_intervention("task-retry", InterventionAction::Retry)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    // the retry itself is an attempt
    assert_eq!(task.replan_attempts, 1);
    assert_eq!(task.consecutive_failures, 0);
    assert!(!task.force_approval);
    assert!(task.intervention_reason.is_none());

    let latest = harness.store.latest_plan("task-retry").await.unwrap().unwrap();
    assert_eq!(latest.version, 3);
    assert_eq!(latest.status, PlanStatus::Completed);
    assert_eq!(latest.context["approval"]["requires_approval"], json!(true));
    assert_eq!(
        latest.context["approval"]["reason"],
        json!("human_intervention_required")
    );
    assert!(latest.context.contains_key("failure_history"));

    let retried = harness.decomposer.calls();
    assert_eq!(retried.last().unwrap().replan.as_ref().unwrap().attempt, 1);
}

#[tokio::test]
async fn test_repeated_replan_failures_escalate() {
    let mut config = fast_config();
    config.replanning.max_attempts = 10;
    config.replanning.escalation_threshold = 3;
    let harness = Harness::new(
        config,
        ScriptedDecomposer::with_failures(vec![Some(body("reach", vec![action("x", &[])])), None]),
        ScriptedActor::new().failing("x", "Connection reset by peer"),
        Arc::new(AutoApprove),
    );

    let err = harness
        .coordinator
        .submit_task(Task::new("task-flaky", "reach"))
        .await
        .unwrap_err();
    match err {
        EngineError::RequiresHumanIntervention { reason, .. } => {
            assert!(reason.contains("3 consecutive failures"));
        }
        other => panic!("expected escalation, got {:?}", other),
    }

    let task = harness.store.require_task("task-flaky").await.unwrap();
    assert_eq!(task.replan_attempts, 2);
    assert_eq!(task.consecutive_failures, 3);
    // failed replans never store a version
    assert_eq!(harness.store.plan_versions("task-flaky").await.unwrap().len(), 1);
    assert_eq!(harness.decomposer.calls().len(), 3);
}

#[tokio::test]
async fn test_rejected_plan_cancels_task() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let approvals = PendingApprovals::new().with_notifier(tx);
    let reviewer = approvals.clone();
    let review = tokio::spawn(async move {
        let (id, request) = rx.recv().await.unwrap();
        reviewer.reject(&id, "not today").unwrap();
        request
    });

    let harness = Harness::new(
        fast_config(),
        ScriptedDecomposer::new(vec![body("deploy", vec![action("x", &[])])]),
        ScriptedActor::new(),
        Arc::new(approvals),
    );
    let task = harness
        .coordinator
        .submit_task(Task::new("task-reject", "deploy").with_autonomy(0))
        .await
        .unwrap();

    let request = review.await.unwrap();
    assert!(request.step_id.is_none());
    assert_eq!(request.plan_version, 1);
    assert_eq!(request.decision.unwrap().reason.as_str(), "manual_oversight");

    assert_eq!(task.status, TaskStatus::Cancelled);
    let plan = harness.store.latest_plan("task-reject").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(plan.error.unwrap().contains("not today"));
    assert_eq!(harness.actor.invocations("x"), 0);
}

#[tokio::test]
async fn test_alternatives_store_only_the_best() {
    let mut config = fast_config();
    config.replanning.generate_alternatives = true;
    let harness = Harness::new(
        config,
        ScriptedDecomposer::new(vec![body("ship", vec![action("a", &[]), action("b", &["a"])])]),
        ScriptedActor::new(),
        Arc::new(AutoApprove),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-alt", "ship"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    // one decomposition per strategy variant
    assert_eq!(harness.decomposer.calls().len(), 3);

    let versions = harness.store.plan_versions("task-alt").await.unwrap();
    assert_eq!(versions.len(), 1);
    let meta = versions[0].alternative.as_ref().unwrap();
    assert!(meta.is_best);
    assert_eq!(meta.rank, 1);

    let report = harness.coordinator.task_status("task-alt").await.unwrap();
    assert_eq!(report.progress_percent, 100.0);
    assert_eq!(report.versions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_timeout_replans_then_escalates() {
    let mut config = fast_config();
    config.executor.step_timeout_secs = 1;
    config.replanning.max_attempts = 1;
    let harness = Harness::new(
        config,
        ScriptedDecomposer::new(vec![body("wait", vec![action("x", &[])])]),
        ScriptedActor::new().slow("x", Duration::from_secs(30)),
        Arc::new(AutoApprove),
    );

    let err = harness
        .coordinator
        .submit_task(Task::new("task-slow", "wait for it"))
        .await
        .unwrap_err();
    match &err {
        EngineError::RequiresHumanIntervention { last_error, .. } => {
            let last = last_error.as_ref().unwrap();
            assert_eq!(last.severity, Severity::Critical);
            assert_eq!(last.category, ErrorCategory::Timeout);
        }
        other => panic!("expected escalation, got {:?}", other),
    }

    let task = harness.store.require_task("task-slow").await.unwrap();
    assert_eq!(task.status, TaskStatus::RequiresHuman);
    assert_eq!(task.timeout_count("x"), 2);
    let severities: Vec<Severity> = task.failure_history.iter().map(|f| f.severity).collect();
    assert_eq!(severities, vec![Severity::Medium, Severity::Critical]);
    assert_eq!(harness.store.plan_versions("task-slow").await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_replans_respect_min_interval() {
    let mut config = fast_config();
    config.replanning.min_interval_secs = 5;
    let harness = Harness::new(
        config,
        ScriptedDecomposer::new(vec![
            body("v1", vec![action("x1", &[])]),
            body("v2", vec![action("x2", &[])]),
            body("v3", vec![action("x3", &[])]),
        ]),
        ScriptedActor::new()
            .failing("x1", "Out of memory")
            .failing("x2", "Out of memory"),
        Arc::new(AutoApprove),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-pace", "pace"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.replan_attempts, 2);

    let times = harness.decomposer.call_times();
    assert_eq!(times.len(), 3);
    // nothing to wait for before the first replan
    assert!(times[1] - times[0] < Duration::from_secs(1));
    assert!(times[2] - times[1] >= Duration::from_millis(4900));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_replan_times_out_and_escalates() {
    let mut config = fast_config();
    config.replanning.max_attempts = 10;
    config.replanning.escalation_threshold = 3;
    config.replanning.attempt_timeout_secs = 5;
    let harness = Harness::new(
        config,
        ScriptedDecomposer::hanging(vec![Some(body("reach", vec![action("x", &[])])), None]),
        ScriptedActor::new().failing("x", "Connection reset by peer"),
        Arc::new(AutoApprove),
    );

    let started = tokio::time::Instant::now();
    let err = harness
        .coordinator
        .submit_task(Task::new("task-hang", "reach"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("3 consecutive failures"));
    // two attempts, each cut off by the attempt timeout
    assert!(started.elapsed() >= Duration::from_secs(10));

    let task = harness.store.require_task("task-hang").await.unwrap();
    assert_eq!(task.status, TaskStatus::RequiresHuman);
    assert_eq!(task.replan_attempts, 2);
    assert_eq!(harness.store.plan_versions("task-hang").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let harness = Harness::new(
        fast_config(),
        ScriptedDecomposer::new(vec![body("deploy", vec![action("x", &[])])]),
        ScriptedActor::new(),
        Arc::new(PendingApprovals::new()),
    );

    let submit = harness
        .coordinator
        .submit_task(Task::new("task-wait", "deploy").with_autonomy(0));
    let cancel = async {
        loop {
            let status = harness
                .store
                .get_task("task-wait")
                .await
                .unwrap()
                .map(|t| t.status);
            if status == Some(TaskStatus::AwaitingApproval) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(harness.coordinator.cancel_task("task-wait"));
    };
    let (task, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(submit, cancel)
    })
    .await
    .unwrap();

    assert_eq!(task.unwrap().status, TaskStatus::Cancelled);
    let plan = harness.store.latest_plan("task-wait").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(plan.error.unwrap().contains("awaiting approval"));
    assert_eq!(harness.actor.invocations("x"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_plan_approval_times_out() {
    let mut config = fast_config();
    config.executor.approval_wait_timeout_secs = Some(60);
    let harness = Harness::new(
        config,
        ScriptedDecomposer::new(vec![body("deploy", vec![action("x", &[])])]),
        ScriptedActor::new(),
        Arc::new(PendingApprovals::new()),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-idle", "deploy").with_autonomy(0))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let plan = harness.store.latest_plan("task-idle").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(plan.error.unwrap().contains("timed out after 60s"));
}

#[tokio::test]
async fn test_store_error_mid_run_releases_the_plan() {
    let store: Arc<dyn PlanStore> = Arc::new(FlakyStore::new().failing_executing_update());
    let harness = Harness::with_store(
        fast_config(),
        store,
        ScriptedDecomposer::new(vec![body("ship", vec![action("a", &[])])]),
        ScriptedActor::new(),
        Arc::new(AutoApprove),
    );

    let task = harness
        .coordinator
        .submit_task(Task::new("task-disk", "ship"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.failure_history[0].severity, Severity::Critical);
    assert_eq!(task.failure_history[0].category, ErrorCategory::Resource);

    let versions = harness.store.plan_versions("task-disk").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].status, PlanStatus::Failed);
    assert!(versions[0].error.as_deref().unwrap().contains("disk full"));
    assert_eq!(versions[0].step("a").unwrap().status, StepStatus::Pending);
    assert_eq!(versions[1].status, PlanStatus::Completed);
}

#[tokio::test]
async fn test_claim_error_fails_the_task() {
    let store: Arc<dyn PlanStore> = Arc::new(FlakyStore::new().failing_claim());
    let harness = Harness::with_store(
        fast_config(),
        store,
        ScriptedDecomposer::new(vec![body("ship", vec![action("a", &[])])]),
        ScriptedActor::new(),
        Arc::new(AutoApprove),
    );

    let err = harness
        .coordinator
        .submit_task(Task::new("task-locked", "ship"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("database is locked"));

    let task = harness.store.require_task("task-locked").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let plan = harness.store.latest_plan("task-locked").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Approved);
}
