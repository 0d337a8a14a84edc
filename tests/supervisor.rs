//! Supervisor behavior: degradation and recovery, operator commands,
//! dependency edges and plan execution with feedback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use sciforge::artifact::{BackendKind, Step};
use sciforge::backend::{LibraryBackend, SharedBackend};
use sciforge::error::BackendError;
use sciforge::monitor::EventKind;
use sciforge::supervisor::{
    CommandOutcome, FeedbackStep, PipelinePlan, PlanStep, StageStatus, Supervisor,
    SupervisorConfig,
};
use sciforge::task::{StageKind, Task, TaskStatus};
use sciforge::{AgentError, SupervisorError};

use common::{complete_customers, customers, Harness, Script, ScriptedBackend};

fn supervisor(harness: &Harness, backend: SharedBackend) -> Supervisor {
    let agents = StageKind::ALL
        .iter()
        .map(|stage| harness.agent(*stage, vec![backend.clone()]))
        .collect();
    Supervisor::new(
        agents,
        harness.cache.clone(),
        harness.sink(),
        SupervisorConfig::default().with_monitor_interval(Duration::from_millis(50)),
    )
}

/// Fails every operation except `ok` (dedupe) and `hang` (waits to be cancelled).
fn routed() -> SharedBackend {
    ScriptedBackend::routed(
        BackendKind::Library,
        Script::Fail(BackendError::Unsupported("not scripted".to_string())),
        vec![
            ("ok", Script::Program(vec![Step::DropDuplicates { subset: None }])),
            ("hang", Script::Hang),
        ],
    )
}

async fn wait_for_running(supervisor: &Supervisor, stage: StageKind) {
    for _ in 0..200 {
        let status = supervisor.status().await.expect("status");
        if status.iter().any(|h| h.stage == stage && h.running > 0) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no task started on {}", stage);
}

#[tokio::test]
async fn test_repeated_failures_degrade_until_recovered() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let supervisor = supervisor(&harness, routed());

    for i in 0..3 {
        let report = supervisor
            .submit(Task::new(StageKind::Cleaning, input.clone(), "broken", json!({"i": i})))
            .await
            .expect("assigned");
        assert_eq!(report.status(), TaskStatus::Failed);
    }

    let status = supervisor.status().await.expect("status");
    let cleaning = status
        .iter()
        .find(|h| h.stage == StageKind::Cleaning)
        .expect("cleaning health");
    assert_eq!(cleaning.status, StageStatus::Degraded);
    assert_eq!(cleaning.consecutive_failures, 3);
    assert!(cleaning.degraded_reason.is_some());
    assert_eq!(harness.sink.count(EventKind::StageDegraded), 1);

    let refused = supervisor
        .submit(Task::new(StageKind::Cleaning, input.clone(), "ok", json!({})))
        .await;
    assert_eq!(
        refused.expect_err("degraded stage refuses work"),
        SupervisorError::StageUnavailable {
            stage: StageKind::Cleaning,
            status: StageStatus::Degraded,
        }
    );
    assert_eq!(harness.sink.count(EventKind::TaskDeferred), 1);

    // Other stages keep working.
    let wrangled = supervisor
        .submit(Task::new(StageKind::Wrangling, input.clone(), "ok", json!({})))
        .await
        .expect("assigned");
    assert!(wrangled.is_success());

    // Resume does not clear a degradation; recover does.
    assert!(supervisor
        .resume(StageKind::Cleaning)
        .await
        .expect("reply")
        .is_rejected());
    assert!(matches!(
        supervisor.recover(StageKind::Cleaning).await.expect("reply"),
        CommandOutcome::Ack
    ));
    assert_eq!(supervisor.stage_status(StageKind::Cleaning), Some(StageStatus::Healthy));
    assert_eq!(harness.sink.count(EventKind::StageRecovered), 1);

    let report = supervisor
        .submit(Task::new(StageKind::Cleaning, input, "ok", json!({})))
        .await
        .expect("assigned after recovery");
    assert_eq!(report.status(), TaskStatus::Executed);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_degradation_cancels_in_flight_tasks() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let supervisor = supervisor(&harness, routed());

    let hanging = supervisor.submit(Task::new(StageKind::Cleaning, input.clone(), "hang", json!({})));
    let failing = async {
        wait_for_running(&supervisor, StageKind::Cleaning).await;
        for i in 0..3 {
            let report = supervisor
                .submit(Task::new(StageKind::Cleaning, input.clone(), "broken", json!({"i": i})))
                .await
                .expect("assigned");
            assert!(!report.is_success());
        }
    };

    let (hung, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(hanging, failing)
    })
    .await
    .expect("degradation released the hanging task");

    let hung = hung.expect("hanging task was assigned");
    assert_eq!(hung.status(), TaskStatus::Failed);
    assert!(matches!(hung.error, Some(AgentError::Cancelled)));

    let degraded = harness
        .sink
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::StageDegraded)
        .expect("degraded event");
    assert_eq!(degraded.stage, Some(StageKind::Cleaning));
    assert!(degraded.detail["last_failure_reasons"].is_array());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_paused_stage_defers_until_resumed() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let supervisor = supervisor(&harness, routed());

    assert!(matches!(
        supervisor.pause(StageKind::Analysis).await.expect("reply"),
        CommandOutcome::Ack
    ));
    let deferred = supervisor
        .submit(Task::new(StageKind::Analysis, input.clone(), "ok", json!({})))
        .await;
    assert!(matches!(
        deferred,
        Err(SupervisorError::StageUnavailable {
            status: StageStatus::Stopped,
            ..
        })
    ));
    // Recover only applies to degraded stages.
    assert!(supervisor
        .recover(StageKind::Analysis)
        .await
        .expect("reply")
        .is_rejected());

    assert!(matches!(
        supervisor.resume(StageKind::Analysis).await.expect("reply"),
        CommandOutcome::Ack
    ));
    let report = supervisor
        .submit(Task::new(StageKind::Analysis, input, "ok", json!({})))
        .await
        .expect("assigned");
    assert!(report.is_success());
    assert_eq!(harness.sink.count(EventKind::StagePaused), 1);
    assert_eq!(harness.sink.count(EventKind::StageResumed), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_dependents_of_failed_tasks_are_not_assigned() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let supervisor = supervisor(&harness, routed());

    let upstream = Task::new(StageKind::Wrangling, input.clone(), "broken", json!({}));
    let healthy = Task::new(StageKind::Wrangling, input.clone(), "ok", json!({}));
    let dependent = Task::new(StageKind::Cleaning, input.clone(), "ok", json!({})).depends_on(upstream.id);
    let chained = Task::new(StageKind::Cleaning, input, "ok", json!({"n": 2})).depends_on(healthy.id);
    let (upstream_id, dependent_id) = (upstream.id, dependent.id);

    // Dependents listed first: they must wait for their upstream.
    let results = supervisor
        .run_tasks(vec![dependent, chained, upstream, healthy])
        .await;

    assert_eq!(
        results[0].as_ref().expect_err("dependent not assigned"),
        &SupervisorError::DependencyFailed(upstream_id)
    );
    assert!(results[1].as_ref().expect("chained assigned").is_success());
    assert_eq!(
        results[2].as_ref().expect("upstream assigned").status(),
        TaskStatus::Failed
    );
    assert!(results[3].as_ref().expect("healthy assigned").is_success());
    assert_eq!(supervisor.pending_tasks(), 0, "finished tasks release their channels");
    assert!(harness
        .sink
        .events()
        .iter()
        .all(|e| !(e.kind == EventKind::TaskAssigned && e.task_id == Some(dependent_id))));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_operator_adjusts_budget_and_concurrency() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness, routed());

    assert!(supervisor
        .set_concurrency(StageKind::Modeling, 0)
        .await
        .expect("reply")
        .is_rejected());
    assert!(matches!(
        supervisor.set_concurrency(StageKind::Modeling, 2).await.expect("reply"),
        CommandOutcome::Ack
    ));
    assert!(matches!(
        supervisor.set_retry_budget(None, 5).await.expect("reply"),
        CommandOutcome::Ack
    ));
    assert_eq!(harness.sink.count(EventKind::ConcurrencyChanged), 1);
    assert_eq!(harness.sink.count(EventKind::RetryBudgetChanged), 6);
    supervisor.shutdown().await;

    assert_eq!(
        supervisor
            .submit(Task::new(
                StageKind::Modeling,
                sciforge::data::DataRef::new("inputs/none"),
                "ok",
                json!({}),
            ))
            .await
            .expect_err("stopped"),
        SupervisorError::ShutDown
    );
}

#[tokio::test]
async fn test_plan_feedback_reengineers_features_for_modeling() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &complete_customers()).await;
    let supervisor = supervisor(&harness, Arc::new(LibraryBackend::new()));

    let plan = PipelinePlan::new("churn")
        .with_step(PlanStep::new(StageKind::Cleaning, "clean", json!({})))
        .with_step(PlanStep::new(
            StageKind::FeatureEngineering,
            "create_features",
            json!({"drop_constant": true}),
        ))
        .with_step(PlanStep::new(
            StageKind::Modeling,
            "baseline",
            json!({"target": "log_income"}),
        ))
        .with_feedback(FeedbackStep {
            trigger: StageKind::Modeling,
            stage: StageKind::FeatureEngineering,
            operation: None,
            params: json!({"log": ["income"]}),
            max_rounds: 1,
        });

    let report = supervisor.run_plan(&plan, input).await.expect("plan ran");
    assert!(report.success, "plan failed: {:?}", report.failed_step());
    assert_eq!(report.feedback_rounds, 1);

    let stages: Vec<(StageKind, TaskStatus, u32)> = report
        .steps
        .iter()
        .map(|s| (s.stage, s.status, s.round))
        .collect();
    assert_eq!(
        stages,
        vec![
            (StageKind::Cleaning, TaskStatus::Executed, 0),
            (StageKind::FeatureEngineering, TaskStatus::Executed, 0),
            (StageKind::Modeling, TaskStatus::Failed, 0),
            (StageKind::FeatureEngineering, TaskStatus::Executed, 1),
            (StageKind::Modeling, TaskStatus::Executed, 1),
        ]
    );

    // The engineered data, not the model report, flows out of the plan.
    let output = sciforge::data::load_dataset(harness.store.as_ref(), &report.data_output)
        .await
        .expect("output");
    assert!(output.columns.contains(&"log_income".to_string()));
    assert_eq!(report.reports().len(), 1);
    assert_eq!(harness.sink.count(EventKind::FeedbackTriggered), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_plan_without_feedback_stops_at_first_failure() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &complete_customers()).await;
    let supervisor = supervisor(&harness, Arc::new(LibraryBackend::new()));

    let plan = PipelinePlan::new("no-feedback")
        .with_step(PlanStep::new(StageKind::Cleaning, "clean", json!({})))
        .with_step(PlanStep::new(StageKind::Modeling, "baseline", json!({"target": "missing"})))
        .with_step(PlanStep::new(StageKind::Interpretation, "feature_importance", json!({"target": "churned"})));

    let report = supervisor.run_plan(&plan, input).await.expect("plan ran");
    assert!(!report.success);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(
        report.failed_step().map(|s| s.stage),
        Some(StageKind::Modeling)
    );
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_feedback_into_report_stage_keeps_data_flowing() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &complete_customers()).await;
    let supervisor = supervisor(&harness, Arc::new(LibraryBackend::new()));

    let plan = PipelinePlan::new("report-feedback")
        .with_step(PlanStep::new(StageKind::Cleaning, "clean", json!({})))
        .with_step(PlanStep::new(StageKind::Analysis, "describe", json!({})))
        .with_step(PlanStep::new(StageKind::Modeling, "baseline", json!({"target": "missing"})))
        .with_feedback(FeedbackStep {
            trigger: StageKind::Modeling,
            stage: StageKind::Analysis,
            operation: Some("correlations".to_string()),
            params: json!({}),
            max_rounds: 1,
        });

    let report = supervisor.run_plan(&plan, input).await.expect("plan ran");
    assert!(!report.success);
    assert_eq!(report.feedback_rounds, 1);
    let stages: Vec<(StageKind, TaskStatus)> = report.steps.iter().map(|s| (s.stage, s.status)).collect();
    assert_eq!(
        stages,
        vec![
            (StageKind::Cleaning, TaskStatus::Executed),
            (StageKind::Analysis, TaskStatus::Executed),
            (StageKind::Modeling, TaskStatus::Failed),
            (StageKind::Analysis, TaskStatus::Executed),
            (StageKind::Modeling, TaskStatus::Failed),
        ]
    );

    // The revised analysis table is recorded, but the cleaned data still flows.
    let cleaned = report.steps[0].output.clone().expect("cleaning output");
    assert_eq!(report.data_output, cleaned);
    let modeling_runs = harness
        .sink
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::TaskAssigned && e.stage == Some(StageKind::Modeling))
        .count();
    assert_eq!(modeling_runs, 2);
    supervisor.shutdown().await;
}
