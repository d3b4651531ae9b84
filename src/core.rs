use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::alerts::{AlertManager, AlertStore, TaskDispatcher, TaskStore};
use crate::config::AppConfig;
use crate::dashboard::{self, DashboardState};
use crate::db;
use crate::engine::EvaluationEngine;
use crate::escalation::EscalationStore;
use crate::fleet::{FleetStore, Organization};
use crate::ingest::MetricIngestor;
use crate::kpi::{Aggregator, AggregationPolicy, KpiStore};
use crate::outreach::{CallStore, HttpVoiceProvider, OutreachTrigger, VoiceProvider};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Storage
    let pool = db::open_pool(&config.state.db_path).await?;
    info!("State store initialized ({})", config.state.db_path);

    let fleet = Arc::new(FleetStore::new(pool.clone()));
    let kpis = Arc::new(KpiStore::new(pool.clone()));
    let alert_store = Arc::new(AlertStore::new(pool.clone()));
    let task_store = Arc::new(TaskStore::new(pool.clone()));
    let escalations = Arc::new(EscalationStore::new(pool.clone()));
    let calls = Arc::new(CallStore::new(pool.clone()));

    // 2. Seed fleet, KPI catalog, thresholds, and the escalation ladder
    let org = seed_from_config(&config, &fleet, &kpis, &escalations).await?;

    // 3. Domain services
    let aggregator = Aggregator::new(AggregationPolicy::from(&config.aggregation));
    let alerts = Arc::new(AlertManager::new(alert_store.clone(), task_store.clone()));
    let tasks = Arc::new(TaskDispatcher::new(task_store.clone()));

    // 4. Voice provider (optional capability)
    let provider: Option<Arc<dyn VoiceProvider>> = if config.outreach.enabled {
        if config.outreach.api_key.is_empty() {
            warn!("Outreach enabled but no API key configured; calls will be logged only");
            None
        } else {
            info!("Voice provider configured ({})", config.outreach.base_url);
            Some(Arc::new(HttpVoiceProvider::new(&config.outreach)?))
        }
    } else {
        info!("Outreach disabled; escalation calls will be logged but not placed");
        None
    };

    let outreach = Arc::new(OutreachTrigger::new(
        calls.clone(),
        escalations.clone(),
        tasks.clone(),
        fleet.clone(),
        provider,
        Duration::from_secs(config.outreach.retry_backoff_secs),
    ));

    // 5. Evaluation engine
    let engine = Arc::new(EvaluationEngine::new(
        fleet.clone(),
        kpis.clone(),
        aggregator,
        alerts.clone(),
        tasks,
        escalations.clone(),
        outreach.clone(),
        config.engine.evaluation_interval_secs,
        config.engine.sla_check_interval_secs,
        config.engine.stale_alert_hours,
    ));

    // First pass up front so a freshly seeded fleet has snapshots before
    // the first scheduled tick.
    if let Err(e) = engine.clone().run_evaluation_pass().await {
        error!("Initial evaluation pass error: {}", e);
    }
    engine.clone().spawn();

    // 6. Ingestion + query surface
    let ingestor = Arc::new(MetricIngestor::new(fleet.clone(), kpis.clone()));

    if config.dashboard.enabled {
        let state = DashboardState {
            pool,
            started_at: std::time::Instant::now(),
            bearer_token: config.dashboard.bearer_token.clone(),
            fleet,
            kpis,
            alerts: alert_store,
            alert_manager: alerts,
            tasks: task_store,
            escalations,
            calls,
            outreach,
            ingestor,
            engine,
        };
        let port = config.dashboard.port;
        tokio::spawn(async move {
            if let Err(e) = dashboard::start_dashboard_server(state, port).await {
                error!("Query API server error: {}", e);
            }
        });
    }

    info!(
        org = %org.name,
        "storepulse v{} running",
        env!("CARGO_PKG_VERSION")
    );

    // 7. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

/// Idempotent startup seeding: upsert by natural key, deactivate what the
/// config no longer lists (stores and KPIs only; rules are operator data).
async fn seed_from_config(
    config: &AppConfig,
    fleet: &Arc<FleetStore>,
    kpis: &Arc<KpiStore>,
    escalations: &Arc<EscalationStore>,
) -> anyhow::Result<Organization> {
    let org = fleet.seed_organization(&config.organization).await?;
    fleet.seed_stores(org.id, &config.stores).await?;
    kpis.seed_definitions(org.id, &config.kpis).await?;

    for threshold in &config.thresholds {
        let Some(definition) = kpis
            .get_definition_by_code(org.id, &threshold.kpi_code)
            .await?
        else {
            warn!(
                kpi = %threshold.kpi_code,
                "Threshold references unknown KPI code; skipped"
            );
            continue;
        };

        let store_id = match &threshold.store_code {
            Some(code) => match fleet.get_store_by_code(code).await? {
                Some(store) => Some(store.id),
                None => {
                    warn!(
                        store = %code,
                        kpi = %threshold.kpi_code,
                        "Threshold references unknown store code; skipped"
                    );
                    continue;
                }
            },
            None => None,
        };

        kpis.upsert_threshold(
            definition.id,
            org.id,
            store_id,
            threshold.green_min,
            threshold.yellow_min,
            threshold.red_threshold,
            crate::kpi::ComparisonBasis::parse(&threshold.comparison_basis),
            threshold.priority,
        )
        .await?;
    }

    let rule_seeds = if config.escalation_rules.is_empty() {
        info!("No escalation rules configured; seeding the default ladder");
        AppConfig::default_escalation_rules()
    } else {
        config.escalation_rules.clone()
    };

    let mut resolved = Vec::with_capacity(rule_seeds.len());
    for seed in rule_seeds {
        let kpi_definition_id = match &seed.kpi_code {
            Some(code) => match kpis.get_definition_by_code(org.id, code).await? {
                Some(definition) => Some(definition.id),
                None => {
                    warn!(kpi = %code, "Escalation rule references unknown KPI code; skipped");
                    continue;
                }
            },
            None => None,
        };
        resolved.push((seed, kpi_definition_id));
    }
    escalations.seed_rules(org.id, &resolved).await?;

    Ok(org)
}
