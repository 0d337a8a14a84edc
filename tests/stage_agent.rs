//! End-to-end behavior of a single stage agent: cache reuse, validation
//! gates, fallback between backends and the retry budget.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use sciforge::agents::AttemptStage;
use sciforge::artifact::{BackendKind, FillStrategy, Step};
use sciforge::backend::{FallbackOrder, LibraryBackend, SharedBackend};
use sciforge::data::{load_dataset, BlobStore, DataRef, Dataset};
use sciforge::error::{BackendError, LlmError};
use sciforge::executor::ResourceLimits;
use sciforge::monitor::EventKind;
use sciforge::task::{IoScope, StageKind, Task, TaskStatus};
use sciforge::AgentError;

use common::{
    broken_program, customers, generative, CannedProvider, Counting, Harness, Script,
    ScriptedBackend,
};

const FILL_AGE_MEDIAN: &str =
    r#"{"steps": [{"op": "fill_missing", "column": "age", "strategy": "median"}], "rationale": "median resists skew"}"#;

#[tokio::test]
async fn test_second_identical_task_is_served_from_cache() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);

    let first = agent
        .run(
            Task::new(StageKind::Cleaning, input.clone(), "clean", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(first.status(), TaskStatus::Executed);
    assert_eq!(first.task.retry_count, 0);
    let result = first.result.clone().expect("result");
    assert!(result.success);
    let cleaned = load_dataset(harness.store.as_ref(), &result.output_ref)
        .await
        .expect("output stored");
    assert_eq!(cleaned.column_count(), 4);
    assert!(cleaned
        .rows
        .iter()
        .all(|row| row.iter().all(|v| !v.is_null())));

    let second = agent
        .run(
            Task::new(StageKind::Cleaning, input, "clean", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(second.status(), TaskStatus::CachedHit);
    assert_eq!(second.result.expect("cached result").output_ref, result.output_ref);
    assert_eq!(library.calls(), 1);
    assert_eq!(harness.executor.executions(), 1);
    assert_eq!(harness.sink.count(EventKind::CacheHit), 1);
    assert_eq!(harness.cache.stats().hits, 1);
    assert_eq!(harness.cache.stats().misses, 1, "the cold run counts one miss");
}

#[tokio::test]
async fn test_invalid_library_program_falls_back_to_generative() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let library = ScriptedBackend::new(BackendKind::Library, Script::Program(broken_program()));
    let provider = CannedProvider::text(FILL_AGE_MEDIAN);
    let agent = harness.agent(
        StageKind::Cleaning,
        vec![library.clone() as SharedBackend, generative(provider.clone())],
    );

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "impute_age", json!({})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Executed);
    assert_eq!(report.task.retry_count, 1);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].backend, BackendKind::Library);
    assert_eq!(report.attempts[0].reached, AttemptStage::Validate);
    assert_eq!(report.attempts[1].backend, BackendKind::Generative);
    assert_eq!(report.attempts[1].reached, AttemptStage::Succeeded);

    let artifact = report.artifact.expect("artifact");
    assert_eq!(artifact.source, BackendKind::Generative);
    assert_eq!(
        artifact.program.steps,
        vec![Step::FillMissing {
            column: Some("age".to_string()),
            strategy: FillStrategy::Median,
            value: None,
        }]
    );

    // The generative backend saw why the library program was rejected.
    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("ghost"));

    // Only the accepted artifact ran.
    assert_eq!(harness.executor.executions(), 1);
    assert_eq!(library.calls(), 1);
    assert_eq!(harness.sink.count(EventKind::Fallback), 1);
    assert_eq!(harness.sink.count(EventKind::ValidationFailed), 1);

    let output = load_dataset(
        harness.store.as_ref(),
        &report.result.expect("result").output_ref,
    )
    .await
    .expect("output");
    let age = output.column_index("age").expect("age column");
    assert!(output.rows.iter().all(|row| !row[age].is_null()));
}

#[tokio::test]
async fn test_all_backends_invalid_fails_with_every_reason() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let library = ScriptedBackend::new(BackendKind::Library, Script::Program(broken_program()));
    let provider = CannedProvider::text(r#"{"steps": [{"op": "select_columns", "columns": ["ghost"]}]}"#);
    let agent = harness
        .agent(
            StageKind::Cleaning,
            vec![library.clone() as SharedBackend, generative(provider.clone())],
        )
        .with_retry_budget(2);

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "impute_age", json!({})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Failed);
    assert!(report.task.retry_count <= 2);
    assert_eq!(report.attempts.len(), 3);
    // The deterministic backend is not asked twice.
    assert_eq!(library.calls(), 1);
    assert_eq!(provider.prompts().len(), 2);
    assert_eq!(harness.executor.executions(), 0);
    assert!(harness.cache.is_empty());

    let failed = harness
        .sink
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::TaskFailed)
        .expect("task failed event");
    let reasons: Vec<String> = failed.detail["reasons"]
        .as_array()
        .expect("reasons")
        .iter()
        .filter_map(|r| r.as_str().map(str::to_string))
        .collect();
    assert_eq!(reasons.len(), 3);
    assert!(reasons.iter().any(|r| r.starts_with("library:")));
    assert!(reasons.iter().any(|r| r.starts_with("generative:")));
}

#[tokio::test]
async fn test_statically_invalid_artifacts_never_execute() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;

    let empty = ScriptedBackend::new(BackendKind::Library, Script::Program(Vec::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![empty as SharedBackend]);
    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input.clone(), "noop", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(report.status(), TaskStatus::Failed);

    let forbidden = ScriptedBackend::new(
        BackendKind::Generative,
        Script::WithSource(
            vec![Step::DropDuplicates { subset: None }],
            "import subprocess\nsubprocess.run(['ls'])".to_string(),
        ),
    );
    let agent = harness
        .agent(StageKind::Cleaning, vec![forbidden.clone() as SharedBackend])
        .with_retry_budget(1);
    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "dedupe", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(report.status(), TaskStatus::Failed);
    assert_eq!(forbidden.calls(), 2);
    assert!(report
        .attempts
        .iter()
        .all(|a| a.reached == AttemptStage::Validate));

    assert_eq!(harness.executor.executions(), 0);
    assert_eq!(harness.sink.count(EventKind::ExecutionStarted), 0);
}

#[tokio::test]
async fn test_unavailable_generative_falls_back_to_library() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let provider = CannedProvider::failing(|| LlmError::RequestFailed("connection refused".to_string()));
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent_with_order(
        StageKind::Cleaning,
        vec![library.clone() as SharedBackend, generative(provider.clone())],
        FallbackOrder::GenerativeFirst,
    );

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "clean", json!({"numeric_strategy": "median"})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Executed);
    assert_eq!(report.task.retry_count, 1);
    assert_eq!(report.attempts[0].backend, BackendKind::Generative);
    assert_eq!(report.attempts[0].reached, AttemptStage::Produce);
    assert_eq!(report.attempts[1].backend, BackendKind::Library);
    assert_eq!(provider.prompts().len(), 1);
    assert_eq!(library.calls(), 1);
    assert_eq!(harness.sink.count(EventKind::BackendFailed), 1);
}

#[tokio::test]
async fn test_retries_stay_within_budget() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let flaky = ScriptedBackend::new(
        BackendKind::Generative,
        Script::Fail(BackendError::SynthesisFailed("no program in answer".to_string())),
    );

    for budget in [0u32, 1, 3] {
        let agent = harness
            .agent(StageKind::Cleaning, vec![flaky.clone() as SharedBackend])
            .with_retry_budget(budget);
        let before = flaky.calls();
        let report = agent
            .run(
                Task::new(StageKind::Cleaning, input.clone(), "impute", json!({"budget": budget})),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.status(), TaskStatus::Failed);
        assert_eq!(report.task.retry_count, budget);
        assert_eq!(flaky.calls() - before, budget as usize + 1);
    }
}

#[tokio::test]
async fn test_cancelled_task_reports_cancellation() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let hang = ScriptedBackend::new(BackendKind::Generative, Script::Hang);
    let agent = harness.agent(StageKind::Cleaning, vec![hang as SharedBackend]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let report = agent
        .run(Task::new(StageKind::Cleaning, input, "impute", json!({})), cancel)
        .await;

    assert_eq!(report.status(), TaskStatus::Failed);
    assert!(matches!(report.error, Some(sciforge::AgentError::Cancelled)));
    assert!(harness.cache.is_empty());
}

#[tokio::test]
async fn test_concurrent_identical_tasks_produce_once() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let library = Counting::with_delay(Arc::new(LibraryBackend::new()), Duration::from_millis(50));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);

    let reports = join_all((0..8).map(|_| {
        agent.run(
            Task::new(StageKind::Cleaning, input.clone(), "clean", json!({})),
            CancellationToken::new(),
        )
    }))
    .await;

    assert!(reports.iter().all(|r| r.is_success()));
    assert_eq!(library.calls(), 1);
    assert_eq!(harness.executor.executions(), 1);
    assert_eq!(
        reports
            .iter()
            .filter(|r| r.status() == TaskStatus::Executed)
            .count(),
        1
    );
    assert_eq!(
        reports
            .iter()
            .filter(|r| r.status() == TaskStatus::CachedHit)
            .count(),
        7
    );
}

#[tokio::test]
async fn test_cached_artifact_invalid_for_new_input_is_replaced() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);
    let task = Task::new(StageKind::Cleaning, input.clone(), "clean", json!({}));
    assert!(agent.run(task.clone(), CancellationToken::new()).await.is_success());

    // Same key, different shape: the cached program names columns that are gone.
    let full = customers();
    let reshaped = Dataset::new(
        vec!["age".to_string()],
        full.rows.iter().map(|row| vec![row[0].clone()]).collect(),
    );
    harness.put("inputs/customers", &reshaped).await;

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "clean", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(report.status(), TaskStatus::Executed);
    assert_eq!(library.calls(), 2);
    assert_eq!(harness.sink.count(EventKind::CacheStale), 1);
}

#[tokio::test]
async fn test_failed_production_is_shared_with_waiting_duplicates() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let failing = ScriptedBackend::with_delay(
        BackendKind::Generative,
        Script::Fail(BackendError::SynthesisFailed("no program in answer".to_string())),
        Duration::from_millis(30),
    );
    let agent = harness
        .agent(StageKind::Cleaning, vec![failing.clone() as SharedBackend])
        .with_retry_budget(0);

    let reports = join_all((0..8).map(|_| {
        agent.run(
            Task::new(StageKind::Cleaning, input.clone(), "impute", json!({})),
            CancellationToken::new(),
        )
    }))
    .await;

    assert_eq!(failing.calls(), 1);
    assert!(reports.iter().all(|r| r.status() == TaskStatus::Failed));
    let adopted: Vec<_> = reports
        .iter()
        .filter(|r| matches!(r.error, Some(AgentError::ProducerFailed { .. })))
        .collect();
    assert_eq!(adopted.len(), 7);
    assert!(adopted
        .iter()
        .all(|r| r.failure_reasons()[0].contains("no program in answer")));
    assert_eq!(harness.cache.in_flight(), 0);

    // Once nobody is queued the failure is forgotten and a new task tries again.
    let again = agent
        .run(
            Task::new(StageKind::Cleaning, input, "impute", json!({})),
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(again.error, Some(AgentError::RetryBudgetExhausted { .. })));
    assert_eq!(failing.calls(), 2);
}

#[tokio::test]
async fn test_execution_over_row_ceiling_fails_at_execute() {
    let harness = Harness::new().with_limits(ResourceLimits::default().with_max_rows(10));
    let input = harness.put("inputs/customers", &customers()).await;
    let agent = harness.agent(StageKind::Cleaning, vec![Arc::new(LibraryBackend::new()) as SharedBackend]);

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "clean", json!({})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Failed);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].reached, AttemptStage::Execute);
    let reason = report.attempts[0].reason.clone().expect("reason");
    assert!(reason.contains("execution failed"), "{}", reason);
    assert!(reason.contains("Row ceiling exceeded"), "{}", reason);
    assert_eq!(harness.sink.count(EventKind::ExecutionFailed), 1);
    assert!(harness.cache.is_empty());
}

#[tokio::test]
async fn test_execution_over_memory_ceiling_fails_at_execute() {
    let harness = Harness::new().with_limits(ResourceLimits::default().with_max_bytes(256));
    let input = harness.put("inputs/customers", &customers()).await;
    let agent = harness.agent(StageKind::Cleaning, vec![Arc::new(LibraryBackend::new()) as SharedBackend]);

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, input, "clean", json!({})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Failed);
    assert_eq!(report.attempts[0].reached, AttemptStage::Execute);
    assert!(report.failure_reasons()[0].contains("execution failed"));
}

#[tokio::test]
async fn test_ragged_stored_input_runs_without_panicking() {
    let harness = Harness::new();
    let blob = br#"{"columns":["age","city"],"rows":[[1,"a"],[null],[3,"c"]]}"#;
    harness
        .store
        .put("inputs/ragged", blob.to_vec())
        .await
        .expect("put");
    let agent = harness.agent(StageKind::Cleaning, vec![Arc::new(LibraryBackend::new()) as SharedBackend]);

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, DataRef::new("inputs/ragged"), "clean", json!({})),
            CancellationToken::new(),
        )
        .await;

    // The short row is padded with nulls on load, so cleaning fills it.
    assert_eq!(report.status(), TaskStatus::Executed);
    assert!(report
        .failure_reasons()
        .iter()
        .all(|r| !r.contains("panicked")));
    let result = report.result.expect("result");
    let cleaned = load_dataset(harness.store.as_ref(), &result.output_ref)
        .await
        .expect("output stored");
    assert!(cleaned.rows.iter().all(|row| row.len() == 2));
}

#[tokio::test]
async fn test_undecodable_input_fails_before_any_backend() {
    let harness = Harness::new();
    harness
        .store
        .put("inputs/garbage", b"{\"columns\": 7}".to_vec())
        .await
        .expect("put");
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);

    let report = agent
        .run(
            Task::new(StageKind::Cleaning, DataRef::new("inputs/garbage"), "clean", json!({})),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.status(), TaskStatus::Failed);
    assert!(matches!(report.error, Some(AgentError::InputUnavailable(_))));
    assert_eq!(library.calls(), 0);
}

#[tokio::test]
async fn test_merge_task_joins_scoped_source() {
    let harness = Harness::new();
    let input = harness.put("inputs/customers", &customers()).await;
    let regions = Dataset::new(
        vec!["city".to_string(), "region".to_string()],
        vec![
            vec![json!("paris"), json!("idf")],
            vec![json!("lyon"), json!("ara")],
            vec![json!("nantes"), json!("pdl")],
            vec![json!("lille"), json!("hdf")],
        ],
    );
    harness.put("refs/regions", &regions).await;
    let agent = harness.agent(StageKind::Wrangling, vec![Arc::new(LibraryBackend::new()) as SharedBackend]);
    let params = json!({"source": "refs/regions", "on": ["city"], "how": "left"});

    let denied = agent
        .run(
            Task::new(StageKind::Wrangling, input.clone(), "merge", params.clone()),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(denied.status(), TaskStatus::Failed);
    assert_eq!(denied.attempts[0].reached, AttemptStage::Validate);
    assert!(denied.failure_reasons()[0].contains("dataset read refs/regions"));

    let task = Task::new(StageKind::Wrangling, input, "merge", params)
        .with_scope(IoScope::default().with_readable_ref("refs"));
    let report = agent.run(task, CancellationToken::new()).await;
    assert_eq!(report.status(), TaskStatus::Executed, "{:?}", report.failure_reasons());
    let merged = load_dataset(harness.store.as_ref(), &report.result.expect("result").output_ref)
        .await
        .expect("output stored");
    assert_eq!(merged.row_count(), 40);
    assert_eq!(merged.columns.last().map(String::as_str), Some("region"));
    let region = merged.column_index("region").expect("region column");
    let city = merged.column_index("city").expect("city column");
    assert!(merged
        .rows
        .iter()
        .filter(|row| row[city] == json!("paris"))
        .all(|row| row[region] == json!("idf")));
}
