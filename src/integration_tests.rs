//! Cross-module scenarios: the full classify -> aggregate -> alert ->
//! escalate -> outreach lifecycle against a real (temp-file) database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::alerts::{AlertManager, AlertSeverity, AlertStore, TaskDispatcher, TaskStore, TaskType};
use crate::config::EscalationRuleSeedConfig;
use crate::engine::EvaluationEngine;
use crate::error::EngineError;
use crate::escalation::EscalationStore;
use crate::fleet::{FleetStore, Organization, Store};
use crate::ingest::{MetricIngestor, MetricSample};
use crate::kpi::{AggregationPolicy, Aggregator, KpiDefinition, KpiStore, MetricStatus};
use crate::outreach::{CallOutcome, CallResponse, CallStatus, CallStore, OutreachTrigger, VoiceProvider};
use crate::testing::{self, MockVoiceProvider};

struct Harness {
    pool: SqlitePool,
    engine: Arc<EvaluationEngine>,
    ingestor: MetricIngestor,
    escalations: Arc<EscalationStore>,
    alerts: Arc<AlertStore>,
    tasks: Arc<TaskStore>,
    calls: Arc<CallStore>,
    org: Organization,
    store: Store,
    kpi: KpiDefinition,
    _db: tempfile::NamedTempFile,
}

fn rule(trigger: &str, duration_hours: i64, from: i64, to: i64, action: &str) -> EscalationRuleSeedConfig {
    EscalationRuleSeedConfig {
        trigger: trigger.to_string(),
        kpi_code: None,
        duration_hours,
        from_level: from,
        to_level: to,
        action: action.to_string(),
    }
}

async fn build_harness(
    rules: Vec<EscalationRuleSeedConfig>,
    provider: Option<Arc<dyn VoiceProvider>>,
) -> Harness {
    let (pool, db_file) = testing::setup_pool().await;
    let (org, store) = testing::seed_fleet(&pool).await;
    let kpi = testing::seed_kpi(&pool, org.id, "sales", "Net Sales", "sales").await;
    testing::seed_threshold(&pool, kpi.id, org.id, -2.0, -8.0, -8.0).await;

    let fleet = Arc::new(FleetStore::new(pool.clone()));
    let kpis = Arc::new(KpiStore::new(pool.clone()));
    let alerts = Arc::new(AlertStore::new(pool.clone()));
    let tasks = Arc::new(TaskStore::new(pool.clone()));
    let escalations = Arc::new(EscalationStore::new(pool.clone()));
    let calls = Arc::new(CallStore::new(pool.clone()));

    let seeds: Vec<_> = rules.into_iter().map(|r| (r, None)).collect();
    escalations.seed_rules(org.id, &seeds).await.unwrap();

    let manager = Arc::new(AlertManager::new(alerts.clone(), tasks.clone()));
    let dispatcher = Arc::new(TaskDispatcher::new(tasks.clone()));
    let outreach = Arc::new(OutreachTrigger::new(
        calls.clone(),
        escalations.clone(),
        dispatcher.clone(),
        fleet.clone(),
        provider,
        Duration::from_millis(10),
    ));

    let engine = Arc::new(EvaluationEngine::new(
        fleet.clone(),
        kpis.clone(),
        Aggregator::new(AggregationPolicy::default()),
        manager,
        dispatcher,
        escalations.clone(),
        outreach,
        900,
        300,
        168,
    ));

    let ingestor = MetricIngestor::new(fleet, kpis);

    Harness {
        pool,
        engine,
        ingestor,
        escalations,
        alerts,
        tasks,
        calls,
        org,
        store,
        kpi,
        _db: db_file,
    }
}

impl Harness {
    async fn ingest_today(&self, kpi_code: &str, value: f64, baseline: f64) {
        self.ingestor
            .ingest(&MetricSample {
                store_code: self.store.store_code.clone(),
                kpi_code: kpi_code.to_string(),
                metric_date: Utc::now().date_naive(),
                value,
                comparison_value: Some(baseline),
                comparison_basis: None,
            })
            .await
            .unwrap();
    }

    /// Shift a live alert's raise time into the past so duration-gated
    /// rules become due without waiting.
    async fn backdate_alert(&self, alert_id: i64, hours: i64) {
        let raised = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        sqlx::query("UPDATE alerts SET raised_at = ? WHERE id = ?")
            .bind(raised)
            .bind(alert_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    /// Push a live alert past its SLA deadline.
    async fn breach_alert_sla(&self, alert_id: i64) {
        let expired = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        sqlx::query("UPDATE alerts SET expires_at = ? WHERE id = ?")
            .bind(expired)
            .bind(alert_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    async fn alert_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn escalation_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM escalations")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn call_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM ai_calls")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

// -------------------------------------------------------------------------
// Escalation lifecycle scenarios
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_sustained_red_escalates_after_48_hours() {
    let harness = build_harness(
        vec![rule("status_red", 48, 0, 2, "send_alert")],
        None,
    )
    .await;

    // Sales at -30% against thresholds green -2 / yellow -8 / red -8.
    harness.ingest_today("sales", 70.0, 100.0).await;
    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();

    // Red immediately, alerted immediately, but no escalation yet: the
    // 48-hour window has not elapsed.
    assert_eq!(report.snapshot.overall_status, MetricStatus::Red);
    assert_eq!(report.alerts_raised, 1);
    assert!(report.escalation.is_none());
    assert_eq!(harness.escalation_count().await, 0);

    // Re-running within the window changes nothing (no duplicate alerts).
    harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(harness.alert_count().await, 1);

    // Two days later the condition still holds.
    let alert = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.severity, AlertSeverity::Red);
    harness.backdate_alert(alert.id, 49).await;

    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();
    let escalation = report.escalation.unwrap();
    assert_eq!(escalation.from_level, 0);
    assert_eq!(escalation.to_level, 2);

    // Exactly one alert, one escalation row, and no AI call has fired.
    assert_eq!(harness.alert_count().await, 1);
    assert_eq!(harness.escalation_count().await, 1);
    assert_eq!(harness.call_count().await, 0);
    assert_eq!(
        harness.escalations.current_level(harness.store.id).await.unwrap(),
        2
    );

    // And the rule does not double-fire now that from_level != current.
    harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(harness.escalation_count().await, 1);
}

#[tokio::test]
async fn test_unanswered_call_keeps_level_and_creates_follow_up() {
    let provider = Arc::new(MockVoiceProvider::new(0));
    let harness = build_harness(
        vec![
            rule("status_red", 0, 0, 2, "send_alert"),
            rule("sla_breach", 0, 2, 3, "ai_call"),
        ],
        Some(provider.clone()),
    )
    .await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(
        harness.escalations.current_level(harness.store.id).await.unwrap(),
        2
    );

    // Miss the response SLA; the next pass rings the store manager.
    let alert = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();
    harness.breach_alert_sla(alert.id).await;

    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(report.escalation.as_ref().unwrap().to_level, 3);
    assert_eq!(provider.call_count(), 1);

    let call = harness
        .calls
        .get_live_for_escalation(report.escalation.as_ref().unwrap().id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.call_status, CallStatus::InProgress);
    assert!(call.script_text.contains("Net Sales"));
    assert!(call.script_text.contains("Downtown"));

    // Provider reports nobody picked up.
    let outreach = OutreachTrigger::new(
        harness.calls.clone(),
        harness.escalations.clone(),
        Arc::new(TaskDispatcher::new(harness.tasks.clone())),
        Arc::new(FleetStore::new(harness.pool.clone())),
        None,
        Duration::from_millis(10),
    );
    outreach
        .record_outcome(
            call.id,
            &CallOutcome {
                status: CallStatus::NoAnswer,
                connected_at: None,
                ended_at: Some(Utc::now()),
                duration_seconds: Some(0),
                transcript: None,
                sentiment: None,
                response: Some(CallResponse::NoAnswer),
            },
        )
        .await
        .unwrap();

    let call = harness.calls.get(call.id).await.unwrap().unwrap();
    assert_eq!(call.call_status, CallStatus::NoAnswer);

    // Level stays 3: no answer is not grounds for regional escalation.
    assert_eq!(
        harness.escalations.current_level(harness.store.id).await.unwrap(),
        3
    );

    let follow_ups: Vec<_> = harness
        .tasks
        .list_open_for_store(harness.store.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.task_type == TaskType::FollowUp)
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert!(follow_ups[0].title.contains("no_answer"));
}

#[tokio::test]
async fn test_missing_threshold_degrades_to_unknown() {
    let harness = build_harness(vec![], None).await;

    // A KPI with no threshold configured anywhere.
    testing::seed_kpi(&harness.pool, harness.org.id, "traffic", "Store Traffic", "traffic").await;

    harness.ingest_today("sales", 99.0, 100.0).await;
    harness.ingest_today("traffic", 500.0, 480.0).await;

    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();

    // The healthy sales metric scores alone; the gap is counted, flagged,
    // and demands attention rather than passing as green.
    assert_eq!(report.snapshot.unknown_kpi_count, 1);
    assert_eq!(report.snapshot.green_kpi_count, 1);
    assert_eq!(report.snapshot.health_score, 100.0);
    assert!(report.snapshot.action_required);
    assert!(report.snapshot.summary.contains("could not be classified"));
    assert!(report.snapshot.summary.contains("Store Traffic"));

    // Unknown never raises an alert.
    assert_eq!(harness.alert_count().await, 0);
}

#[tokio::test]
async fn test_yellow_ladder_creates_task_at_level_1() {
    let harness = build_harness(
        vec![rule("status_yellow", 24, 0, 1, "create_task")],
        None,
    )
    .await;

    // -5% is yellow against green -2 / yellow -8.
    harness.ingest_today("sales", 95.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(harness.escalation_count().await, 0);

    let alert = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();
    harness.backdate_alert(alert.id, 25).await;

    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();
    let escalation = report.escalation.unwrap();
    assert_eq!(escalation.to_level, 1);

    let open = harness.tasks.list_open_for_store(harness.store.id).await.unwrap();
    let escalation_tasks: Vec<_> = open
        .iter()
        .filter(|t| t.task_type == TaskType::Escalation)
        .collect();
    assert_eq!(escalation_tasks.len(), 1);
    assert!(escalation_tasks[0].title.contains("Level 1"));
    assert_eq!(escalation_tasks[0].assigned_to_role, "store_manager");
}

#[tokio::test]
async fn test_resolve_resets_ladder_with_audit() {
    let harness = build_harness(
        vec![rule("status_red", 0, 0, 2, "send_alert")],
        None,
    )
    .await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(
        harness.escalations.current_level(harness.store.id).await.unwrap(),
        2
    );

    let resolved = harness
        .engine
        .resolve_store(harness.store.id, "Root cause fixed")
        .await
        .unwrap();
    assert!(resolved);

    // Level back to 0, with the resolve recorded as its own audit row.
    assert_eq!(
        harness.escalations.current_level(harness.store.id).await.unwrap(),
        0
    );
    assert_eq!(harness.escalation_count().await, 2);

    // Cascade: no live alerts, no open tasks.
    assert!(harness
        .alerts
        .list_live_for_store(harness.store.id)
        .await
        .unwrap()
        .is_empty());
    assert!(harness
        .tasks
        .list_open_for_store(harness.store.id)
        .await
        .unwrap()
        .is_empty());

    // Resolving again is a no-op.
    let resolved = harness
        .engine
        .resolve_store(harness.store.id, "again")
        .await
        .unwrap();
    assert!(!resolved);
}

// -------------------------------------------------------------------------
// Uniqueness invariants under concurrency
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_alert_creation_leaves_one_row() {
    let harness = build_harness(vec![], None).await;
    let day = Utc::now().date_naive();
    let deadline = Utc::now() + chrono::Duration::hours(24);

    let store_a = harness.alerts.clone();
    let store_b = harness.alerts.clone();
    let (store_id, kpi_id) = (harness.store.id, harness.kpi.id);

    let (a, b) = tokio::join!(
        store_a.upsert_live(
            store_id,
            kpi_id,
            day,
            AlertSeverity::Red,
            "first",
            "first message",
            true,
            deadline,
        ),
        store_b.upsert_live(
            store_id,
            kpi_id,
            day,
            AlertSeverity::Red,
            "second",
            "second message",
            true,
            deadline,
        ),
    );
    a.unwrap();
    b.unwrap();

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM alerts WHERE store_id = ? AND kpi_definition_id = ?
         AND status IN ('active', 'acknowledged')",
    )
    .bind(store_id)
    .bind(kpi_id)
    .fetch_one(&harness.pool)
    .await
    .unwrap();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn test_concurrent_call_claims_yield_single_record() {
    let harness = build_harness(
        vec![rule("status_red", 0, 0, 2, "send_alert")],
        None,
    )
    .await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();
    let escalation_id = report.escalation.unwrap().id;

    let calls_a = harness.calls.clone();
    let calls_b = harness.calls.clone();
    let store_id = harness.store.id;

    let (a, b) = tokio::join!(
        calls_a.claim(
            store_id,
            None,
            escalation_id,
            crate::outreach::ScriptKind::Red,
            "Jamie",
            "+15550101",
            "script",
            1,
        ),
        calls_b.claim(
            store_id,
            None,
            escalation_id,
            crate::outreach::ScriptKind::Red,
            "Jamie",
            "+15550101",
            "script",
            1,
        ),
    );

    // Exactly one claim wins; the loser sees a DuplicateWrite, which the
    // trigger treats as already handled.
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(
        loser.as_ref().unwrap_err().downcast_ref::<EngineError>(),
        Some(EngineError::DuplicateWrite(_))
    ));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ai_calls WHERE escalation_id = ?")
        .bind(escalation_id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_stale_breached_alerts_expire() {
    let harness = build_harness(vec![], None).await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();

    let alert = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();

    // Deadline blown a week plus change ago.
    let long_past = (Utc::now() - chrono::Duration::hours(200)).to_rfc3339();
    sqlx::query("UPDATE alerts SET expires_at = ? WHERE id = ?")
        .bind(&long_past)
        .bind(alert.id)
        .execute(&harness.pool)
        .await
        .unwrap();

    let expired = harness.alerts.expire_stale(Utc::now(), 168).await.unwrap();
    assert_eq!(expired, 1);

    // Expired is terminal, not resolved, and no longer live.
    assert!(harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .is_none());
    let status: String = sqlx::query_scalar("SELECT status FROM alerts WHERE id = ?")
        .bind(alert.id)
        .fetch_one(&harness.pool)
        .await
        .unwrap();
    assert_eq!(status, "expired");
}

// -------------------------------------------------------------------------
// Aggregation and snapshot behavior through the engine
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_snapshot_upsert_is_idempotent() {
    let harness = build_harness(vec![], None).await;

    harness.ingest_today("sales", 95.0, 100.0).await;
    let first = harness.engine.evaluate_store(&harness.store).await.unwrap();
    let second = harness.engine.evaluate_store(&harness.store).await.unwrap();

    assert_eq!(first.snapshot, second.snapshot);

    let rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM store_health_snapshots WHERE store_id = ?",
    )
    .bind(harness.store.id)
    .fetch_one(&harness.pool)
    .await
    .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_two_yellows_read_as_overall_red() {
    let harness = build_harness(vec![], None).await;

    let labor = testing::seed_kpi(&harness.pool, harness.org.id, "labor", "Labor Coverage", "labor").await;
    testing::seed_threshold(&harness.pool, labor.id, harness.org.id, -2.0, -8.0, -8.0).await;

    harness.ingest_today("sales", 95.0, 100.0).await;
    harness.ingest_today("labor", 94.0, 100.0).await;

    let report = harness.engine.evaluate_store(&harness.store).await.unwrap();
    assert_eq!(report.snapshot.yellow_kpi_count, 2);
    assert_eq!(report.snapshot.red_kpi_count, 0);
    assert_eq!(report.snapshot.overall_status, MetricStatus::Red);
}

#[tokio::test]
async fn test_refresh_does_not_extend_sla_deadline() {
    let harness = build_harness(vec![], None).await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();

    let alert = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();
    let original_deadline = alert.expires_at.unwrap();
    let original_raised = alert.raised_at;

    // A later pass with a slightly different value refreshes the message
    // but keeps the clock.
    harness.ingest_today("sales", 72.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();

    let refreshed = harness
        .alerts
        .get_live(harness.store.id, harness.kpi.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.id, alert.id);
    assert_eq!(refreshed.expires_at.unwrap(), original_deadline);
    assert_eq!(refreshed.raised_at, original_raised);
    assert!(refreshed.message.contains("28.0%"));
}

#[tokio::test]
async fn test_red_sales_alert_fans_out_tasks() {
    let harness = build_harness(vec![], None).await;

    harness.ingest_today("sales", 70.0, 100.0).await;
    harness.engine.evaluate_store(&harness.store).await.unwrap();

    let open = harness.tasks.list_open_for_store(harness.store.id).await.unwrap();
    // Red sales: district manager contact plus store manager review.
    assert_eq!(open.len(), 2);
    assert!(open.iter().any(|t| t.assigned_to_role == "district_manager"));
    assert!(open.iter().any(|t| t.assigned_to_role == "store_manager"));
    assert!(open
        .iter()
        .all(|t| t.description.as_deref().unwrap_or("").contains("Recommended actions")));
}
