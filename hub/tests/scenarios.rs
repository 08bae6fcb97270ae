//! End-to-end scenario tests (S1-S6) against the in-memory `RecordStore`
//! fake, covering the scenarios and invariants at the pipeline/rollup/alert
//! layer without standing up a real network transport or Postgres.

use std::sync::Arc;
use std::time::Duration;

use beszel_hub::alerts::AlertEngine;
use beszel_hub::auth::{self, FingerprintDecision};
use beszel_hub::db::{InMemoryStore, RecordStore};
use beszel_hub::pipeline::RecordPipeline;
use beszel_hub::rollup;

use beszel_core::{
    AgentInfo, AlertRule, CombinedData, ContainerStats, System, SystemStats, SystemStatus,
};
use chrono::Utc;
use uuid::Uuid;

fn seeded_system(store: &InMemoryStore, status: &str) -> Uuid {
    let id = Uuid::new_v4();
    store.seed_system(System {
        id,
        user_id: Uuid::new_v4(),
        name: "s1".into(),
        host: "127.0.0.1".into(),
        port: "45876".into(),
        status: status.into(),
        info: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });
    id
}

/// S1 — happy tick: committing one agent payload flips the system to `up`
/// and writes exactly one `1m` stats row alongside it.
#[tokio::test]
async fn s1_happy_tick_marks_up_with_matching_stats_row() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "pending");
    let pipeline = RecordPipeline::new(store.clone());

    let data = CombinedData {
        stats: SystemStats { cpu: 12.5, mem_pct: 40.0, disk_pct: 10.0, ..Default::default() },
        info: AgentInfo { v: "0.12.0".into() },
        containers: vec![],
        systemd: vec![],
        details: None,
        smart: vec![],
    };
    pipeline.commit(system_id, &data).await.unwrap();

    let system = store.get_system(system_id).await.unwrap().unwrap();
    assert_eq!(system.status(), SystemStatus::Up);

    let rows = store
        .list_system_stats_in_window(system_id, "1m", Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let stats: SystemStats = serde_json::from_value(rows[0].stats.clone()).unwrap();
    assert_eq!(stats.cpu, 12.5);
}

/// S1 variant — container rows land alongside the system stats row in the
/// same tick.
#[tokio::test]
async fn s1_container_rows_committed_with_tick() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "pending");
    let pipeline = RecordPipeline::new(store.clone());

    let data = CombinedData {
        stats: SystemStats { cpu: 5.0, ..Default::default() },
        info: AgentInfo { v: "0.12.0".into() },
        containers: vec![ContainerStats { container_id: "c1".into(), name: "nginx".into(), ..Default::default() }],
        systemd: vec![],
        details: None,
        smart: vec![],
    };
    pipeline.commit(system_id, &data).await.unwrap();

    let key = store.upsert_container(system_id, "c1", "nginx").await.unwrap();
    let rows = store
        .list_container_stats_in_window(system_id, key, "1m", Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

/// S2 — rollup: ten `1m` samples with cpu 10,20,...,100 roll up into one
/// `10m` row whose mean is 55.0 and whose peak is 100.0.
#[tokio::test]
async fn s2_rollup_averages_and_tracks_peak() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "up");

    for step in 1..=10 {
        let stats = SystemStats { cpu: (step * 10) as f64, mem_pct: 0.0, disk_pct: 0.0, ..Default::default() };
        store.insert_system_stats_record(system_id, "1m", &serde_json::to_value(stats).unwrap()).await.unwrap();
    }

    let store: Arc<dyn RecordStore> = store;
    rollup::run_once(&store).await.unwrap();

    let rolled = store
        .list_system_stats_in_window(system_id, "10m", Utc::now() - chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(rolled.len(), 1);
    let stats: SystemStats = serde_json::from_value(rolled[0].stats.clone()).unwrap();
    assert_eq!(stats.cpu, 55.0);
    assert_eq!(stats.max_cpu, Some(100.0));
}

fn status_rule(system_id: Uuid, user_id: Uuid, min_duration_minutes: i64) -> AlertRule {
    AlertRule {
        id: Uuid::new_v4(),
        system_id,
        user_id,
        name: "Status".into(),
        descriptor: None,
        threshold: 0.0,
        min_duration_minutes,
        enabled: true,
        triggered: false,
    }
}

/// S3 — status alert with debounce: an immediate (`min=0`) down transition
/// triggers exactly one history row, and recovery resolves it.
#[tokio::test]
async fn s3_status_alert_triggers_down_and_resolves_on_recovery() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "up");
    let user_id = store.get_system(system_id).await.unwrap().unwrap().user_id;
    store.seed_alert_rule(status_rule(system_id, user_id, 0));
    let engine = AlertEngine::new(store.clone());

    engine.on_status_change(system_id, SystemStatus::Up, SystemStatus::Down).await;
    // The countdown task runs on a spawned task with a zero-length sleep;
    // give the scheduler a turn to land it before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set_system_status(system_id, "down", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rules = store.list_alert_rules(system_id).await.unwrap();
    assert!(rules[0].triggered, "status rule should have triggered after debounce elapsed");

    let history = store.alert_history_snapshot();
    assert_eq!(history.iter().filter(|h| h.system_id == system_id).count(), 1);
    assert!(history[0].resolved_at.is_none());

    engine.on_status_change(system_id, SystemStatus::Down, SystemStatus::Up).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rules = store.list_alert_rules(system_id).await.unwrap();
    assert!(!rules[0].triggered);
    let history = store.alert_history_snapshot();
    assert!(history.iter().any(|h| h.system_id == system_id && h.resolved_at.is_some()));
}

/// S3 debounce law — a down interval shorter than `min_duration` produces no
/// notification: cancel the countdown (via recovery) before its deadline and
/// confirm the rule never fired.
#[tokio::test]
async fn s3_short_down_interval_produces_no_trigger() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "up");
    let user_id = store.get_system(system_id).await.unwrap().unwrap().user_id;
    store.seed_alert_rule(status_rule(system_id, user_id, 5));
    let engine = AlertEngine::new(store.clone());

    engine.on_status_change(system_id, SystemStatus::Up, SystemStatus::Down).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.on_status_change(system_id, SystemStatus::Down, SystemStatus::Up).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rules = store.list_alert_rules(system_id).await.unwrap();
    assert!(!rules[0].triggered, "recovery before the debounce deadline must cancel the countdown");
    assert!(store.alert_history_snapshot().is_empty());
}

/// S4 — sliding-value alert: two ticks averaging above threshold trigger a
/// breach; two more averaging below it trigger a recovery.
#[tokio::test]
async fn s4_sliding_cpu_alert_breaches_then_recovers() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "up");
    let user_id = store.get_system(system_id).await.unwrap().unwrap().user_id;
    let rule = AlertRule {
        id: Uuid::new_v4(),
        system_id,
        user_id,
        name: "CPU".into(),
        descriptor: None,
        threshold: 80.0,
        min_duration_minutes: 0,
        enabled: true,
        triggered: false,
    };
    store.seed_alert_rule(rule);
    let engine = AlertEngine::new(store.clone());

    engine.evaluate_tick(system_id, &SystemStats { cpu: 90.0, ..Default::default() }).await;
    engine.evaluate_tick(system_id, &SystemStats { cpu: 95.0, ..Default::default() }).await;
    assert!(store.list_alert_rules(system_id).await.unwrap()[0].triggered);

    engine.evaluate_tick(system_id, &SystemStats { cpu: 10.0, ..Default::default() }).await;
    engine.evaluate_tick(system_id, &SystemStats { cpu: 20.0, ..Default::default() }).await;
    assert!(!store.list_alert_rules(system_id).await.unwrap()[0].triggered);
}

/// S6 — fingerprint lock: the first handshake binds, a second handshake
/// with a different fingerprint is rejected, and the stored value never
/// changes.
#[tokio::test]
async fn s6_fingerprint_lock_rejects_second_value() {
    let store = Arc::new(InMemoryStore::new());
    let system_id = seeded_system(&store, "up");

    let stored = store.get_fingerprint(system_id).await.unwrap();
    let decision = auth::reconcile(stored.as_ref().map(|f| f.fingerprint.as_str()), "F1");
    assert_eq!(decision, FingerprintDecision::Bind);
    store.bind_fingerprint(system_id, "F1").await.unwrap();

    let stored = store.get_fingerprint(system_id).await.unwrap();
    let decision = auth::reconcile(stored.as_ref().map(|f| f.fingerprint.as_str()), "F2");
    assert_eq!(decision, FingerprintDecision::Reject);

    let stored = store.get_fingerprint(system_id).await.unwrap().unwrap();
    assert_eq!(stored.fingerprint, "F1");
    let system = store.get_system(system_id).await.unwrap().unwrap();
    assert_eq!(system.status(), SystemStatus::Up);
}
