//! The evaluation engine: per-store critical sections and the recurring
//! passes that drive the escalation lifecycle.
//!
//! One pass over a store is: lock, aggregate today's metrics into a
//! snapshot, raise or refresh alerts for breaching metrics, evaluate the
//! escalation rules, commit any due transition, collect side-effect
//! intents, unlock, dispatch. The only network I/O (the outreach call)
//! always happens after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alerts::{AlertManager, TaskDispatcher};
use crate::error::EngineError;
use crate::escalation::{
    escalation_target, Escalation, EscalationAction, EscalationMachine, EscalationStore,
    RuleContext, RuleEvaluator,
};
use crate::fleet::{FleetStore, Organization, Store};
use crate::kpi::{Aggregator, HealthSnapshot, KpiStore, MetricStatus};
use crate::outreach::{AiCallRecord, OutreachTrigger, ScriptKind, ScriptVars};

/// Per-store advisory locks. Two evaluation passes for the same store
/// serialize; different stores proceed in parallel.
pub struct StoreLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl StoreLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, store_id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(store_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

impl Default for StoreLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// What one evaluation of one store did. Returned for callers (and tests)
/// that want to inspect the pass; the tick loops just log it.
pub struct EvaluationReport {
    pub snapshot: HealthSnapshot,
    pub alerts_raised: usize,
    pub escalation: Option<Escalation>,
}

/// A side effect decided inside the critical section, dispatched after it.
enum SideEffect {
    EscalationTask {
        escalation: Escalation,
        kpi_definition_id: Option<i64>,
        kpi_name: String,
    },
    Notify {
        escalation: Escalation,
    },
    Call {
        escalation: Escalation,
        record: AiCallRecord,
    },
}

pub struct EvaluationEngine {
    fleet: Arc<FleetStore>,
    kpis: Arc<KpiStore>,
    aggregator: Aggregator,
    alerts: Arc<AlertManager>,
    tasks: Arc<TaskDispatcher>,
    escalations: Arc<EscalationStore>,
    machine: EscalationMachine,
    outreach: Arc<OutreachTrigger>,
    locks: StoreLocks,
    evaluation_interval: Duration,
    sla_check_interval: Duration,
    stale_alert_hours: u32,
}

impl EvaluationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<FleetStore>,
        kpis: Arc<KpiStore>,
        aggregator: Aggregator,
        alerts: Arc<AlertManager>,
        tasks: Arc<TaskDispatcher>,
        escalations: Arc<EscalationStore>,
        outreach: Arc<OutreachTrigger>,
        evaluation_interval_secs: u64,
        sla_check_interval_secs: u64,
        stale_alert_hours: u32,
    ) -> Self {
        Self {
            fleet,
            kpis,
            aggregator,
            alerts,
            tasks,
            machine: EscalationMachine::new(escalations.clone()),
            escalations,
            outreach,
            locks: StoreLocks::new(),
            evaluation_interval: Duration::from_secs(evaluation_interval_secs),
            sla_check_interval: Duration::from_secs(sla_check_interval_secs),
            stale_alert_hours,
        }
    }

    /// Spawn the two background loops: the full evaluation pass and the
    /// faster SLA-timer pass.
    pub fn spawn(self: Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            info!(
                interval_secs = engine.evaluation_interval.as_secs(),
                "Evaluation loop started"
            );
            loop {
                tokio::time::sleep(engine.evaluation_interval).await;
                if let Err(e) = engine.clone().run_evaluation_pass().await {
                    error!("Evaluation pass error: {}", e);
                }
            }
        });

        tokio::spawn(async move {
            info!(
                interval_secs = self.sla_check_interval.as_secs(),
                "SLA check loop started"
            );
            loop {
                tokio::time::sleep(self.sla_check_interval).await;
                if let Err(e) = self.clone().run_sla_pass().await {
                    error!("SLA pass error: {}", e);
                }
            }
        });
    }

    /// Evaluate every active store. Stores are independent, so the pass
    /// fans out and joins.
    pub async fn run_evaluation_pass(self: Arc<Self>) -> anyhow::Result<()> {
        let stores = self.fleet.list_active_stores().await?;
        if stores.is_empty() {
            return Ok(());
        }

        info!(count = stores.len(), "Running evaluation pass");

        let mut join_set = tokio::task::JoinSet::new();
        for store in stores {
            let engine = self.clone();
            join_set.spawn(async move {
                if let Err(e) = engine.evaluate_store(&store).await {
                    error!(store = %store.store_code, "Store evaluation error: {}", e);
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        Ok(())
    }

    /// The faster pass: retire long-stale alerts, then re-evaluate only the
    /// stores with a breached SLA so their `sla_breach` rules can fire
    /// between full passes.
    pub async fn run_sla_pass(self: Arc<Self>) -> anyhow::Result<()> {
        self.alerts.expire_stale(self.stale_alert_hours).await?;

        let now = Utc::now();
        let overdue = self.alerts.alerts().list_overdue(now).await?;
        let mut store_ids: HashSet<i64> = overdue.iter().map(|a| a.store_id).collect();
        store_ids.extend(
            self.tasks
                .tasks()
                .list_open()
                .await?
                .iter()
                .filter(|t| t.is_overdue(now))
                .map(|t| t.store_id),
        );

        if store_ids.is_empty() {
            return Ok(());
        }

        info!(
            overdue_alerts = overdue.len(),
            stores = store_ids.len(),
            "Running SLA pass"
        );

        for store_id in store_ids {
            let Some(store) = self.fleet.get_store(store_id).await? else {
                continue;
            };
            if let Err(e) = self.evaluate_store(&store).await {
                error!(store = %store.store_code, "SLA re-evaluation error: {}", e);
            }
        }

        Ok(())
    }

    pub async fn evaluate_store_by_id(&self, store_id: i64) -> anyhow::Result<Option<EvaluationReport>> {
        match self.fleet.get_store(store_id).await? {
            Some(store) => Ok(Some(self.evaluate_store(&store).await?)),
            None => Ok(None),
        }
    }

    /// One full evaluation of one store: the critical section runs
    /// classify-aggregate-evaluate-commit, then side effects dispatch with
    /// the lock released.
    pub async fn evaluate_store(&self, store: &Store) -> anyhow::Result<EvaluationReport> {
        let org = self
            .fleet
            .get_organization(store.organization_id)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "store {} references missing organization {}",
                    store.store_code, store.organization_id
                ))
            })?;

        let guard = self.locks.acquire(store.id).await;
        let (report, side_effects) = match self.evaluate_locked(store, &org).await {
            Ok(result) => result,
            Err(e) => {
                // A stale level means another pass got there first; the next
                // tick re-reads and re-evaluates from fresh state.
                if let Some(EngineError::StaleState { .. }) = e.downcast_ref::<EngineError>() {
                    warn!(store = %store.store_code, "Evaluation raced a level change; skipping");
                    drop(guard);
                    return Ok(EvaluationReport {
                        snapshot: self.read_back_snapshot(store).await?,
                        alerts_raised: 0,
                        escalation: None,
                    });
                }
                return Err(e);
            }
        };
        drop(guard);

        for effect in side_effects {
            self.dispatch_side_effect(store, effect).await;
        }

        Ok(report)
    }

    /// The critical section body. No network I/O in here.
    async fn evaluate_locked(
        &self,
        store: &Store,
        org: &Organization,
    ) -> anyhow::Result<(EvaluationReport, Vec<SideEffect>)> {
        let now = Utc::now();
        let today = now.date_naive();

        let metrics = self.kpis.latest_metrics_for_day(store.id, today).await?;
        let definitions = self.kpis.list_definitions(org.id).await?;
        let current_level = self.escalations.current_level(store.id).await?;

        let snapshot = self
            .aggregator
            .aggregate(store.id, today, &metrics, &definitions, current_level);
        self.kpis.upsert_snapshot(&snapshot).await?;

        // Raise or refresh an alert per breaching metric; new alerts fan
        // out their remediation tasks immediately.
        let mut alerts_raised = 0;
        for metric in metrics.iter().filter(|m| m.status.is_breach()) {
            let Some(definition) = definitions.iter().find(|d| d.id == metric.kpi_definition_id)
            else {
                continue;
            };
            if let Some(raised) = self.alerts.raise_for_metric(store, definition, metric).await? {
                if raised.created {
                    alerts_raised += 1;
                    self.tasks
                        .dispatch_for_alert(store, definition, &raised.alert)
                        .await?;
                }
            }
        }

        // The driving alert: most severe live alert, oldest in its tier.
        let live_alerts = self.alerts.alerts().list_live_for_store(store.id).await?;
        let driving = live_alerts.first();

        // A breached SLA is either an alert past its deadline or an open
        // remediation task past its due date.
        let open_tasks = self.tasks.tasks().list_open_for_store(store.id).await?;
        let sla_breached = live_alerts.iter().any(|a| a.is_overdue(now))
            || open_tasks.iter().any(|t| t.is_overdue(now));

        let ctx = RuleContext {
            current_level,
            red_count: snapshot.red_kpi_count,
            yellow_count: snapshot.yellow_kpi_count,
            alert_severity: driving.map(|a| a.severity.metric_status()),
            condition_held_hours: driving
                .map(|a| (now - a.raised_at).num_minutes() as f64 / 60.0)
                .unwrap_or(0.0),
            sla_breached,
            predicted_risk: false,
        };

        let rules = self
            .escalations
            .rules_for(org.id, driving.map(|a| a.kpi_definition_id))
            .await?;

        let mut side_effects = Vec::new();
        let mut committed = None;

        if let Some(proposal) = RuleEvaluator::first_due(&rules, &ctx) {
            let target = escalation_target(store, org, proposal.to_level);
            let escalation = self
                .machine
                .commit_transition(store.id, &proposal, driving.map(|a| a.id), &target)
                .await?;

            self.kpis
                .set_snapshot_level(store.id, today, escalation.to_level)
                .await?;

            let kpi_definition_id = driving.map(|a| a.kpi_definition_id);
            let kpi_name = kpi_definition_id
                .and_then(|id| definitions.iter().find(|d| d.id == id))
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "Store health".to_string());

            match proposal.action {
                EscalationAction::CreateTask => side_effects.push(SideEffect::EscalationTask {
                    escalation: escalation.clone(),
                    kpi_definition_id,
                    kpi_name,
                }),
                EscalationAction::SendAlert => side_effects.push(SideEffect::Notify {
                    escalation: escalation.clone(),
                }),
                EscalationAction::AiCall => {
                    // Claim the outreach slot while still holding the lock;
                    // the provider call itself runs after release.
                    let script = match driving.map(|a| a.severity.metric_status()) {
                        Some(MetricStatus::Red) => ScriptKind::Red,
                        _ => ScriptKind::Yellow,
                    };
                    let vars = ScriptVars {
                        store_name: store.name.clone(),
                        manager_name: store.manager_name.clone(),
                        kpi_name: kpi_name.clone(),
                        variance_pct: driving
                            .and_then(|a| {
                                metrics
                                    .iter()
                                    .find(|m| m.kpi_definition_id == a.kpi_definition_id)
                            })
                            .and_then(|m| m.variance_pct)
                            .unwrap_or(0.0),
                        health_score: snapshot.health_score,
                    };
                    if let Some(record) = self
                        .outreach
                        .claim(store, org, &escalation, script, &vars)
                        .await?
                    {
                        side_effects.push(SideEffect::Call {
                            escalation: escalation.clone(),
                            record,
                        });
                    }
                }
                EscalationAction::RegionalEscalation => {
                    side_effects.push(SideEffect::EscalationTask {
                        escalation: escalation.clone(),
                        kpi_definition_id,
                        kpi_name: kpi_name.clone(),
                    });
                    side_effects.push(SideEffect::Notify {
                        escalation: escalation.clone(),
                    });
                }
            }

            committed = Some(escalation);
        }

        let snapshot = HealthSnapshot {
            escalation_level: committed
                .as_ref()
                .map(|e| e.to_level)
                .unwrap_or(current_level),
            ..snapshot
        };

        Ok((
            EvaluationReport {
                snapshot,
                alerts_raised,
                escalation: committed,
            },
            side_effects,
        ))
    }

    /// Dispatch one collected side effect. Failures are logged, never
    /// propagated: the escalation row is already durable, so any of these
    /// can be retried from it.
    async fn dispatch_side_effect(&self, store: &Store, effect: SideEffect) {
        match effect {
            SideEffect::EscalationTask {
                escalation,
                kpi_definition_id,
                kpi_name,
            } => {
                match self
                    .tasks
                    .create_escalation_task(store, &escalation, kpi_definition_id, &kpi_name)
                    .await
                {
                    Ok(task) => {
                        if let Err(e) = self.escalations.set_task(escalation.id, task.id).await {
                            warn!(escalation_id = escalation.id, "Failed to link task: {}", e);
                        }
                    }
                    Err(e) => {
                        error!(
                            store = %store.store_code,
                            escalation_id = escalation.id,
                            "Failed to create escalation task: {}",
                            e
                        );
                    }
                }
            }
            SideEffect::Notify { escalation } => {
                // Notification fan-out (SMS/email/push) is an external
                // collaborator; the engine records the intent in the log.
                info!(
                    store = %store.store_code,
                    escalation_id = escalation.id,
                    level = escalation.to_level,
                    to = %escalation.escalated_to_role,
                    contact = ?escalation.escalated_to_contact,
                    "Escalation notification"
                );
            }
            SideEffect::Call { escalation, record } => {
                if let Err(e) = self.outreach.dispatch(record, store, &escalation).await {
                    error!(
                        store = %store.store_code,
                        escalation_id = escalation.id,
                        "Outreach dispatch error: {}",
                        e
                    );
                }
            }
        }
    }

    /// Explicit resolve: audited drop to level 0, cascading to alerts and
    /// open tasks. The only path by which a store's level decreases.
    pub async fn resolve_store(&self, store_id: i64, resolution: &str) -> anyhow::Result<bool> {
        let Some(store) = self.fleet.get_store(store_id).await? else {
            anyhow::bail!("store {} not found", store_id);
        };
        let org = self
            .fleet
            .get_organization(store.organization_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("organization {} not found", store.organization_id))?;

        let guard = self.locks.acquire(store.id).await;

        let target = escalation_target(&store, &org, 1);
        let resolved = self.machine.resolve(store.id, resolution, &target).await?;
        if resolved.is_none() {
            drop(guard);
            return Ok(false);
        }

        let resolved_alerts = self.alerts.resolve_all_for_store(store.id).await?;
        let cancelled_tasks = self
            .tasks
            .tasks()
            .cancel_open_for_store(store.id, "Store resolved")
            .await?;
        self.kpis
            .set_snapshot_level(store.id, Utc::now().date_naive(), 0)
            .await?;

        drop(guard);

        info!(
            store = %store.store_code,
            resolved_alerts,
            cancelled_tasks,
            "Store resolved"
        );

        Ok(true)
    }

    async fn read_back_snapshot(&self, store: &Store) -> anyhow::Result<HealthSnapshot> {
        let today = Utc::now().date_naive();
        self.kpis
            .get_snapshot(store.id, today)
            .await?
            .ok_or_else(|| anyhow::anyhow!("snapshot missing for store {}", store.store_code))
    }
}
