//! Time-to-live behavior of cached artifacts as seen through an agent.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use sciforge::backend::{LibraryBackend, SharedBackend};
use sciforge::cache::{ArtifactCache, CacheConfig, ManualClock};
use sciforge::monitor::EventKind;
use sciforge::task::{StageKind, Task, TaskStatus};

use common::{customers, Counting, Harness};

const TTL: Duration = Duration::from_secs(900);

#[tokio::test]
async fn test_entry_expires_ttl_after_last_use() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let harness = Harness::new().with_cache(ArtifactCache::with_clock(
        CacheConfig::default().with_ttl(TTL),
        clock.clone(),
    ));
    let input = harness.put("inputs/customers", &customers()).await;
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);
    let task = || Task::new(StageKind::Cleaning, input.clone(), "clean", json!({}));

    assert_eq!(
        agent.run(task(), CancellationToken::new()).await.status(),
        TaskStatus::Executed
    );

    // Just inside the window: reused, and the use restarts the clock.
    clock.advance(TTL - Duration::from_millis(1));
    assert_eq!(
        agent.run(task(), CancellationToken::new()).await.status(),
        TaskStatus::CachedHit
    );
    clock.advance(TTL - Duration::from_millis(1));
    assert_eq!(
        agent.run(task(), CancellationToken::new()).await.status(),
        TaskStatus::CachedHit
    );
    assert_eq!(library.calls(), 1);

    // Exactly one TTL of idleness: expired, so the artifact is produced again.
    clock.advance(TTL);
    assert_eq!(
        agent.run(task(), CancellationToken::new()).await.status(),
        TaskStatus::Executed
    );
    assert_eq!(library.calls(), 2);
    assert_eq!(harness.sink.count(EventKind::CacheHit), 2);
    assert_eq!(harness.cache.stats().expirations, 1);
}

#[tokio::test]
async fn test_expired_entry_is_not_served_to_other_tasks() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let harness = Harness::new().with_cache(ArtifactCache::with_clock(
        CacheConfig::default().with_ttl(Duration::from_secs(60)),
        clock.clone(),
    ));
    let input = harness.put("inputs/customers", &customers()).await;
    let library = Counting::new(Arc::new(LibraryBackend::new()));
    let agent = harness.agent(StageKind::Cleaning, vec![library.clone() as SharedBackend]);

    let first = agent
        .run(
            Task::new(StageKind::Cleaning, input.clone(), "deduplicate", json!({})),
            CancellationToken::new(),
        )
        .await;
    let fingerprint = first.task.fingerprint.clone();
    assert!(harness.cache.lookup(&fingerprint).await.is_some());

    clock.advance(Duration::from_secs(61));
    assert!(harness.cache.lookup(&fingerprint).await.is_none());
    assert!(harness.cache.is_empty());
}
