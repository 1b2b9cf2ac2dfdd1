//! Integration tests for interrupted-run teardown.
//!
//! Drives collection and processing together against the in-memory stores:
//! 1. An interrupt reason is set on a run
//! 2. The collector decides whether the run is due
//! 3. The processor deletes the pod and writes the outcome


use std::time::Duration;

use chrono::TimeDelta;
use enginectl_controller::cluster::{EnginePod, ENGINE_LABEL_KEY, RUN_LABEL_KEY};
use enginectl_controller::pod_template::engine_pod_name;
use enginectl_controller::settings::Settings;
use enginectl_reconcile::Clock;
use enginectl_runs::{results, Run, RunRegistry, RunStatus};
use harness::Harness;

fn settings() -> Settings {
    Settings {
        interrupt_grace_period: Duration::from_secs(120),
        ..Settings::default()
    }
}

/// A running run with an archive record and a pod.
async fn running_run(h: &Harness, name: &str) -> String {
    let record = format!("arc-{name}");
    h.archive.insert(&record, name, RunStatus::Running).await;
    h.registry
        .insert(Run::new(name, RunStatus::Running).with_archive_run_id(&record))
        .await;
    h.add_engine_pod(name).await
}

#[tokio::test]
async fn test_nothing_collected_while_dependencies_are_down() {
    let h = Harness::new(settings());
    for i in 0..5 {
        h.registry
            .insert(Run::new(format!("U{i}"), RunStatus::Queued).with_interrupt("cancelled", None))
            .await;
    }

    assert!(h.collector().collect().await.unwrap().is_empty());

    h.cluster.add_ready_dependencies(harness::NS, harness::INSTALL).await;
    assert_eq!(h.collector().collect().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_grace_period_boundary() {
    let h = Harness::ready(settings()).await;
    running_run(&h, "U1").await;
    let interrupted_at = h.clock.now();
    h.registry
        .request_interrupt("U1", "cancelled".into(), Some(interrupted_at))
        .await
        .unwrap();

    h.clock.set(interrupted_at + TimeDelta::seconds(119));
    assert!(h.collector().collect().await.unwrap().is_empty());

    h.clock.set(interrupted_at + TimeDelta::seconds(120));
    let events = h.collector().collect().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].run_name, "U1");
}

#[tokio::test]
async fn test_run_without_pod_skips_grace_period() {
    let h = Harness::ready(settings()).await;
    h.registry.insert(Run::new("U1", RunStatus::Queued)).await;
    h.registry
        .request_interrupt("U1", "cancelled".into(), Some(h.clock.now()))
        .await
        .unwrap();

    let events = h.collector().collect().await.unwrap();
    assert_eq!(events.len(), 1);

    let stats = h.processor().process_events(events).await;
    assert_eq!(stats.finished, 1);
    let run = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);
    assert_eq!(run.result.as_deref(), Some(results::CANCELLED));
}

#[tokio::test]
async fn test_cancel_finishes_run_and_record() {
    let h = Harness::ready(settings()).await;
    let pod = running_run(&h, "U1").await;
    h.registry
        .request_interrupt("U1", "cancelled".into(), None)
        .await
        .unwrap();

    let events = h.collector().collect().await.unwrap();
    h.processor().process_events(events).await;

    let run = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);
    assert_eq!(run.result.as_deref(), Some(results::CANCELLED));
    let record = h.archive.record("arc-U1").await.unwrap();
    assert_eq!(record.status, RunStatus::Finished);
    assert_eq!(record.result.as_deref(), Some(results::CANCELLED));
    assert!(!h.has_pod(&pod).await);

    assert!(h.collector().collect().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requeue_returns_run_to_queue_and_finishes_record() {
    let h = Harness::ready(settings()).await;
    let pod = running_run(&h, "U1").await;
    h.registry
        .request_interrupt("U1", "requeued".into(), None)
        .await
        .unwrap();

    let events = h.collector().collect().await.unwrap();
    h.processor().process_events(events).await;

    let run = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.is_schedulable());
    let record = h.archive.record("arc-U1").await.unwrap();
    assert_eq!(record.status, RunStatus::Finished);
    assert_eq!(record.result.as_deref(), Some(results::REQUEUED));
    assert!(!h.has_pod(&pod).await);
    assert_eq!(h.archive.records_for("U1").await.len(), 2);
}

#[tokio::test]
async fn test_hung_run_is_finished_as_hung() {
    let h = Harness::ready(settings()).await;
    running_run(&h, "U1").await;
    h.registry
        .request_interrupt("U1", "hung".into(), None)
        .await
        .unwrap();

    let events = h.collector().collect().await.unwrap();
    h.processor().process_events(events).await;

    let run = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(run.result.as_deref(), Some(results::HUNG));
}

#[tokio::test]
async fn test_failing_run_does_not_block_batch() {
    let h = Harness::ready(settings()).await;
    let first_pod = running_run(&h, "U1").await;
    let second_pod = running_run(&h, "U2").await;
    for name in ["U1", "U2"] {
        h.registry
            .request_interrupt(name, "cancelled".into(), None)
            .await
            .unwrap();
    }

    let events = h.collector().collect().await.unwrap();
    assert_eq!(events.len(), 2);
    h.registry.fail_writes_for("U1").await;

    let stats = h.processor().process_events(events).await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.finished, 1);

    assert!(!h.has_pod(&first_pod).await);
    assert!(!h.has_pod(&second_pod).await);
    let first = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Running);
    let second = h.registry.get_run("U2").await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Finished);
    assert_eq!(
        h.archive.record("arc-U2").await.unwrap().status,
        RunStatus::Finished
    );

    let retry = h.collector().collect().await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].run_name, "U1");
}

#[tokio::test]
async fn test_reprocessing_after_pod_is_gone_is_harmless() {
    let h = Harness::ready(settings()).await;
    let pod = running_run(&h, "U1").await;
    h.registry
        .request_interrupt("U1", "cancelled".into(), None)
        .await
        .unwrap();
    let other = h.add_engine_pod("U9").await;

    let events = h.collector().collect().await.unwrap();
    h.processor().process_events(events.clone()).await;
    let stats = h.processor().process_events(events).await;

    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pods_deleted, 0);
    assert!(!h.has_pod(&pod).await);
    assert!(h.has_pod(&other).await);
}

#[tokio::test]
async fn test_failed_requeue_is_retried_and_relaunches() {
    let h = Harness::ready(settings()).await;
    let label = h.settings.current().engine_label.clone();
    let pod = engine_pod_name(&label, "U1");
    h.archive.insert("arc-U1", "U1", RunStatus::Running).await;
    h.registry
        .insert(Run::new("U1", RunStatus::Running).with_archive_run_id("arc-U1"))
        .await;
    h.cluster
        .add_pod(
            harness::NS,
            EnginePod::new(pod.clone())
                .with_label(ENGINE_LABEL_KEY, &label)
                .with_label(RUN_LABEL_KEY, "U1"),
        )
        .await;
    h.registry
        .request_interrupt("U1", "requeued".into(), None)
        .await
        .unwrap();

    h.archive.set_fail_creates(true);
    let events = h.collector().collect().await.unwrap();
    let stats = h.processor().process_events(events).await;
    assert_eq!(stats.failed, 1);
    assert!(!h.has_pod(&pod).await);

    h.archive.set_fail_creates(false);
    let retry = h.collector().collect().await.unwrap();
    assert_eq!(retry.len(), 1);
    let stats = h.processor().process_events(retry).await;
    assert_eq!(stats.requeued, 1);

    let stats = h.scheduler().schedule().await.unwrap();
    assert_eq!(stats.launched, 1);
    assert_eq!(stats.gave_up, 0);
    let run = h.registry.get_run("U1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Allocated);
    assert!(h.has_pod(&pod).await);
}
