use outpost_core::{Error, Filters, RetryPolicy};
use outpost_sync::{Engine, MemoryRemote};
use outpost_test_utils::{ids, minutes_ago, record, seconds_from_now, TestEngine};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_stale_delete_skipped() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.remote.put(
        "students",
        record(json!({"id": "s1", "name": "Ada", "updated_at": minutes_ago(60)})),
    );
    t.engine.get_all("students", &Filters::new()).await?;
    t.remember_session("user-1");

    t.go_offline();
    t.engine.remove("students", "s1").await?;

    // Another client edits the row after the delete was queued
    t.remote.put(
        "students",
        record(json!({"id": "s1", "name": "Ada L.", "updated_at": seconds_from_now(10)})),
    );

    t.go_online();
    let report = t.engine.process_sync_queue().await?;
    assert_eq!(report.synced, 0);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(t.engine.sync_queue_status().pending, 0);

    let server = t.remote.get("students", "s1").expect("row must survive");
    assert_eq!(server["name"], "Ada L.");
    Ok(())
}

#[tokio::test]
async fn test_version_conflict_surfaced() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.remote.put(
        "fees",
        record(json!({"id": "f1", "amount": 100, "version": 3})),
    );

    let err = t
        .engine
        .update("fees", "f1", record(json!({"amount": 90, "version": 2})))
        .await
        .unwrap_err();
    let failure = err.to_failure();
    assert!(!failure.success);
    assert_eq!(failure.error, "VERSION_CONFLICT");
    assert_eq!(
        failure.details,
        json!({"currentVersion": 3, "attemptedVersion": 2})
    );
    assert_eq!(t.remote.get("fees", "f1").unwrap()["amount"], 100);

    // The matching version goes through and bumps it
    let saved = t
        .engine
        .update("fees", "f1", record(json!({"amount": 90, "version": 3})))
        .await?;
    assert_eq!(saved.data["version"], 4);
    assert_eq!(t.remote.get("fees", "f1").unwrap()["amount"], 90);
    Ok(())
}

#[tokio::test]
async fn test_reconnection_drain_stats() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.remote.put(
        "fees",
        record(json!({"id": "f2", "amount": 200, "version": 1, "updated_at": minutes_ago(60)})),
    );
    t.remote.put(
        "students",
        record(json!({"id": "s1", "name": "Ada", "updated_at": minutes_ago(60)})),
    );
    t.engine.get_all("fees", &Filters::new()).await?;
    t.engine.get_all("students", &Filters::new()).await?;
    t.remember_session("user-1");

    t.go_offline();
    t.engine
        .create("fees", record(json!({"id": "f1", "amount": 100})))
        .await?;
    t.engine
        .update("fees", "f2", record(json!({"amount": 250})))
        .await?;
    t.engine.remove("students", "s1").await?;
    assert_eq!(t.engine.sync_queue_status().pending, 3);

    // Concurrent server edits: f2 moved past the base of the queued update,
    // s1 changed after the delete was queued
    t.remote.put(
        "fees",
        record(json!({"id": "f2", "amount": 300, "version": 1, "updated_at": minutes_ago(30)})),
    );
    t.remote.put(
        "students",
        record(json!({"id": "s1", "name": "Ada L.", "updated_at": seconds_from_now(10)})),
    );

    t.go_online();
    let report = t.engine.process_sync_queue().await?;
    assert_eq!(report.synced, 2);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(report.resolved, 1);
    assert_eq!(t.engine.sync_queue_status().pending, 0);

    assert_eq!(t.remote.get("fees", "f1").unwrap()["amount"], 100);
    let f2 = t.remote.get("fees", "f2").unwrap();
    assert_eq!(f2["amount"], 250);
    assert_eq!(f2["conflict_resolution"], "local_wins_timestamp");
    assert!(t.remote.get("students", "s1").is_some());
    Ok(())
}

#[tokio::test]
async fn test_update_within_tolerance_applies_directly() -> anyhow::Result<()> {
    let t = TestEngine::new();
    let base = minutes_ago(10);
    t.remote.put(
        "fees",
        record(json!({"id": "f1", "amount": 100, "version": 1, "updated_at": base})),
    );
    t.engine.get_all("fees", &Filters::new()).await?;
    t.remember_session("user-1");

    t.go_offline();
    t.engine
        .update("fees", "f1", record(json!({"amount": 110})))
        .await?;

    t.go_online();
    let report = t.engine.process_sync_queue().await?;
    assert_eq!(report.synced, 1);
    assert_eq!(report.resolved, 0);

    let f1 = t.remote.get("fees", "f1").unwrap();
    assert_eq!(f1["amount"], 110);
    assert!(f1.get("conflict_resolution").is_none());
    Ok(())
}

#[tokio::test]
async fn test_queue_converges_after_reconnect() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.remember_session("user-1");
    t.go_offline();

    for n in 1..=5 {
        t.engine
            .create("payments", record(json!({"id": format!("p{}", n), "amount": n * 10})))
            .await?;
    }
    t.engine
        .update("payments", "p2", record(json!({"amount": 25})))
        .await?;
    t.engine.remove("payments", "p5").await?;
    assert_eq!(t.engine.sync_queue_status().pending, 7);

    // Draining while offline does nothing
    assert!(t.engine.process_sync_queue().await?.is_empty());

    t.go_online();
    let report = t.engine.sync_now().await?;
    assert_eq!(report.drain.errors, 0);
    assert_eq!(t.engine.sync_queue_status().pending, 0);
    assert_eq!(ids(&t.remote.records("payments")), vec!["p1", "p2", "p3", "p4"]);
    assert_eq!(t.remote.get("payments", "p2").unwrap()["amount"], 25);

    // Local state matches the server after reconciliation
    t.go_offline();
    let local = t.engine.get_all("payments", &Filters::new()).await?;
    assert_eq!(ids(&local.data), vec!["p1", "p2", "p3", "p4"]);
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_dead_letter_and_retry() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryRemote::new());
    let engine = Engine::builder()
        .with_remote(remote.clone())
        .with_config(
            outpost_core::EngineConfig::new()
                .with_probe_cache_window(std::time::Duration::ZERO)
                .with_retry_policy(RetryPolicy::immediate(2)),
        )
        .build()?;
    engine
        .create("fees", record(json!({"id": "f0"})))
        .await?;

    remote.set_reachable(false);
    engine
        .create("fees", record(json!({"id": "f1", "amount": 100})))
        .await?;
    remote.set_reachable(true);

    // Each injected failure is consumed by the drain's fetch
    remote.fail_next(Error::Remote("HTTP 503".to_string()));
    let first = engine.process_sync_queue().await?;
    assert_eq!(first.errors, 1);
    assert_eq!(engine.sync_queue_status().pending, 1);

    remote.fail_next(Error::Remote("HTTP 503".to_string()));
    let second = engine.process_sync_queue().await?;
    assert_eq!(second.errors, 1);
    let status = engine.sync_queue_status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.failed, 1);

    assert_eq!(engine.retry_failed()?, 1);
    let third = engine.process_sync_queue().await?;
    assert_eq!(third.synced, 1);
    assert!(remote.get("fees", "f1").is_some());
    Ok(())
}

#[tokio::test]
async fn test_permanent_failure_is_dropped() -> anyhow::Result<()> {
    let t = TestEngine::new();
    t.remember_session("user-1");
    t.go_offline();
    t.engine
        .create("fees", record(json!({"id": "f1", "amount": 100})))
        .await?;
    t.go_online();

    // A constraint violation never succeeds on retry
    t.remote.fail_next(Error::DuplicateKey("fees_pkey".to_string()));
    let report = t.engine.process_sync_queue().await?;
    assert_eq!(report.dropped, 1);
    assert_eq!(report.errors, 0);
    assert_eq!(t.engine.sync_queue_status().pending, 0);
    assert_eq!(t.engine.sync_queue_status().failed, 0);
    assert!(t.remote.get("fees", "f1").is_none());
    Ok(())
}
