//! The HTTP surface: read-only query projections over the persisted state,
//! the metric-ingestion endpoint, and the explicit store-resolve action.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::alerts::{AlertManager, AlertStore, TaskStore};
use crate::engine::EvaluationEngine;
use crate::escalation::EscalationStore;
use crate::fleet::FleetStore;
use crate::ingest::{is_unclassified, MetricIngestor, MetricSample};
use crate::kpi::KpiStore;
use crate::outreach::{CallOutcome, CallResponse, CallStatus, CallStore, OutreachTrigger};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DashboardState {
    pub pool: SqlitePool,
    pub started_at: Instant,
    /// Unset means open access (localhost-only deployments).
    pub bearer_token: Option<String>,
    pub fleet: Arc<FleetStore>,
    pub kpis: Arc<KpiStore>,
    pub alerts: Arc<AlertStore>,
    pub alert_manager: Arc<AlertManager>,
    pub tasks: Arc<TaskStore>,
    pub escalations: Arc<EscalationStore>,
    pub calls: Arc<CallStore>,
    pub outreach: Arc<OutreachTrigger>,
    pub ingestor: Arc<MetricIngestor>,
    pub engine: Arc<EvaluationEngine>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: DashboardState) -> Router {
    let api = Router::new()
        .route("/api/overview", get(api_overview))
        .route("/api/stores/critical", get(api_critical_stores))
        .route("/api/stores/{code}", get(api_store_detail))
        .route("/api/stores/{code}/kpis", get(api_store_kpis))
        .route("/api/stores/{code}/resolve", post(api_resolve_store))
        .route("/api/alerts", get(api_alerts))
        .route("/api/alerts/{id}/acknowledge", post(api_acknowledge_alert))
        .route("/api/alerts/{id}/resolve", post(api_resolve_alert))
        .route("/api/tasks", get(api_tasks))
        .route("/api/tasks/{id}/complete", post(api_complete_task))
        .route("/api/escalations", get(api_escalations))
        .route("/api/calls", get(api_calls))
        .route("/api/calls/outcome", post(api_call_outcome))
        .route("/api/metrics", post(api_ingest_metric))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<DashboardState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(expected) = &state.bearer_token else {
        return Ok(next.run(request).await);
    };

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(sqlx::FromRow)]
struct StatusCountRow {
    overall_status: String,
    n: i64,
}

async fn api_overview(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

    let active_stores: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM stores WHERE status = 'active'")
            .fetch_one(&state.pool)
            .await
            .unwrap_or(0);

    let status_counts = sqlx::query_as::<_, StatusCountRow>(
        "SELECT overall_status, COUNT(*) as n FROM store_health_snapshots
         WHERE snapshot_date = ? GROUP BY overall_status",
    )
    .bind(&today)
    .fetch_all(&state.pool)
    .await
    .unwrap_or_default();

    let count_for = |status: &str| {
        status_counts
            .iter()
            .find(|r| r.overall_status == status)
            .map(|r| r.n)
            .unwrap_or(0)
    };

    let avg_health: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(health_score) FROM store_health_snapshots WHERE snapshot_date = ?",
    )
    .bind(&today)
    .fetch_one(&state.pool)
    .await
    .unwrap_or(None);

    let escalated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM store_health_snapshots
         WHERE snapshot_date = ? AND escalation_level > 0",
    )
    .bind(&today)
    .fetch_one(&state.pool)
    .await
    .unwrap_or(0);

    let live_alerts: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM alerts WHERE status IN ('active', 'acknowledged')",
    )
    .fetch_one(&state.pool)
    .await
    .unwrap_or(0);

    let open_tasks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'in_progress')",
    )
    .fetch_one(&state.pool)
    .await
    .unwrap_or(0);

    Json(json!({
        "date": today,
        "active_stores": active_stores,
        "green": count_for("green"),
        "yellow": count_for("yellow"),
        "red": count_for("red"),
        "average_health_score": avg_health,
        "escalated_stores": escalated,
        "live_alerts": live_alerts,
        "open_tasks": open_tasks,
    }))
}

#[derive(sqlx::FromRow)]
struct CriticalStoreRow {
    store_code: String,
    name: String,
    overall_status: String,
    health_score: f64,
    red_kpi_count: i64,
    yellow_kpi_count: i64,
    escalation_level: i64,
    summary: Option<String>,
}

async fn api_critical_stores(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

    let rows = sqlx::query_as::<_, CriticalStoreRow>(
        "SELECT s.store_code, s.name, h.overall_status, h.health_score,
                h.red_kpi_count, h.yellow_kpi_count, h.escalation_level, h.summary
         FROM store_health_snapshots h
         JOIN stores s ON s.id = h.store_id
         WHERE h.snapshot_date = ? AND (h.overall_status = 'red' OR h.escalation_level >= 2)
         ORDER BY h.health_score ASC",
    )
    .bind(&today)
    .fetch_all(&state.pool)
    .await
    .unwrap_or_default();

    let vals: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|r| {
            json!({
                "store_code": r.store_code,
                "name": r.name,
                "overall_status": r.overall_status,
                "health_score": r.health_score,
                "red_kpi_count": r.red_kpi_count,
                "yellow_kpi_count": r.yellow_kpi_count,
                "escalation_level": r.escalation_level,
                "summary": r.summary,
            })
        })
        .collect();

    Json(serde_json::Value::Array(vals))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_days")]
    days: i64,
}

fn default_history_days() -> i64 {
    14
}

async fn api_store_detail(
    State(state): State<DashboardState>,
    Path(code): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let store = match state.fleet.get_store_by_code(&code).await {
        Ok(Some(store)) => store,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("store not found: {}", code)})),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    let history = state
        .kpis
        .snapshot_history(store.id, q.days.clamp(1, 90))
        .await
        .unwrap_or_default();
    let current_level = state.escalations.current_level(store.id).await.unwrap_or(0);
    let escalations = state.escalations.history(store.id, 20).await.unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "store": store,
            "escalation_level": current_level,
            "latest_snapshot": history.first(),
            "history": history,
            "escalations": escalations,
        })),
    )
}

#[derive(Deserialize)]
struct KpiBreakdownQuery {
    date: Option<NaiveDate>,
    /// Drill into one KPI's recent history instead of the daily breakdown.
    kpi_code: Option<String>,
    #[serde(default = "default_history_days")]
    days: i64,
}

async fn api_store_kpis(
    State(state): State<DashboardState>,
    Path(code): Path<String>,
    Query(q): Query<KpiBreakdownQuery>,
) -> impl IntoResponse {
    let store = match state.fleet.get_store_by_code(&code).await {
        Ok(Some(store)) => store,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("store not found: {}", code)})),
            );
        }
    };

    if let Some(kpi_code) = &q.kpi_code {
        let Ok(Some(definition)) = state
            .kpis
            .get_definition_by_code(store.organization_id, kpi_code)
            .await
        else {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("KPI not found: {}", kpi_code)})),
            );
        };
        let history = state
            .kpis
            .metric_history(store.id, definition.id, q.days.clamp(1, 90))
            .await
            .unwrap_or_default();
        return (
            StatusCode::OK,
            Json(json!({
                "store_code": store.store_code,
                "kpi_code": definition.kpi_code,
                "kpi_name": definition.name,
                "history": history,
            })),
        );
    }

    let date = q.date.unwrap_or_else(|| Utc::now().date_naive());
    let metrics = state
        .kpis
        .latest_metrics_for_day(store.id, date)
        .await
        .unwrap_or_default();
    let definitions = state
        .kpis
        .list_definitions(store.organization_id)
        .await
        .unwrap_or_default();

    let vals: Vec<serde_json::Value> = metrics
        .into_iter()
        .map(|m| {
            let definition = definitions.iter().find(|d| d.id == m.kpi_definition_id);
            json!({
                "kpi_code": definition.map(|d| d.kpi_code.as_str()),
                "kpi_name": definition.map(|d| d.name.as_str()),
                "category": definition.map(|d| d.category.as_str()),
                "value": m.value,
                "comparison_value": m.comparison_value,
                "variance_pct": m.variance_pct,
                "status": m.status.as_str(),
                "recorded_at": m.recorded_at.to_rfc3339(),
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "store_code": store.store_code,
            "date": date.format("%Y-%m-%d").to_string(),
            "metrics": vals,
        })),
    )
}

async fn api_alerts(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    let alerts = state.alerts.list_live().await.unwrap_or_default();
    Json(json!(alerts))
}

#[derive(Deserialize)]
struct AcknowledgeBody {
    acknowledged_by: String,
}

async fn api_acknowledge_alert(
    State(state): State<DashboardState>,
    Path(id): Path<i64>,
    Json(body): Json<AcknowledgeBody>,
) -> impl IntoResponse {
    match state.alert_manager.acknowledge(id, &body.acknowledged_by).await {
        Ok(()) => (StatusCode::OK, Json(json!({"alert_id": id, "status": "acknowledged"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn api_resolve_alert(
    State(state): State<DashboardState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.alert_manager.resolve(id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"alert_id": id, "status": "resolved"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn api_tasks(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    let tasks = state.tasks.list_open().await.unwrap_or_default();
    Json(json!(tasks))
}

#[derive(Deserialize)]
struct CompleteTaskBody {
    completed_by: String,
    outcome: Option<String>,
}

async fn api_complete_task(
    State(state): State<DashboardState>,
    Path(id): Path<i64>,
    Json(body): Json<CompleteTaskBody>,
) -> impl IntoResponse {
    match state
        .tasks
        .complete(id, &body.completed_by, body.outcome.as_deref())
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({"task_id": id, "status": "completed"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn api_escalations(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    let escalations = state.escalations.list_open().await.unwrap_or_default();
    Json(json!(escalations))
}

#[derive(Deserialize)]
struct CallsQuery {
    store_code: Option<String>,
    #[serde(default = "default_calls_limit")]
    limit: i64,
}

fn default_calls_limit() -> i64 {
    50
}

async fn api_calls(
    State(state): State<DashboardState>,
    Query(q): Query<CallsQuery>,
) -> Json<serde_json::Value> {
    let limit = q.limit.clamp(1, 200);

    let calls = match q.store_code {
        Some(code) => match state.fleet.get_store_by_code(&code).await {
            Ok(Some(store)) => state.calls.history(store.id, limit).await.unwrap_or_default(),
            _ => Vec::new(),
        },
        None => {
            // Fleet-wide recent calls.
            let rows = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM ai_calls ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&state.pool)
            .await
            .unwrap_or_default();

            let mut calls = Vec::with_capacity(rows.len());
            for id in rows {
                if let Ok(Some(call)) = state.calls.get(id).await {
                    calls.push(call);
                }
            }
            calls
        }
    };

    Json(json!(calls))
}

/// The provider's callback payload, keyed by its own call id.
#[derive(Deserialize)]
struct CallOutcomeBody {
    external_call_id: String,
    status: String,
    connected_at: Option<chrono::DateTime<Utc>>,
    ended_at: Option<chrono::DateTime<Utc>>,
    duration_seconds: Option<i64>,
    transcript: Option<String>,
    sentiment: Option<String>,
    response: Option<String>,
}

async fn api_call_outcome(
    State(state): State<DashboardState>,
    Json(body): Json<CallOutcomeBody>,
) -> impl IntoResponse {
    let call = match state.calls.get_by_external_id(&body.external_call_id).await {
        Ok(Some(call)) => call,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("unknown call: {}", body.external_call_id)})),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    let outcome = CallOutcome {
        status: CallStatus::parse(&body.status),
        connected_at: body.connected_at,
        ended_at: body.ended_at,
        duration_seconds: body.duration_seconds,
        transcript: body.transcript,
        sentiment: body.sentiment,
        response: body.response.as_deref().map(CallResponse::parse),
    };

    match state.outreach.record_outcome(call.id, &outcome).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"call_id": call.id, "status": outcome.status.as_str()})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn api_ingest_metric(
    State(state): State<DashboardState>,
    Json(sample): Json<MetricSample>,
) -> impl IntoResponse {
    match state.ingestor.ingest(&sample).await {
        Ok(metric) => {
            // Ad-hoc re-evaluation so a breach surfaces before the next
            // scheduled pass.
            if let Err(e) = state.engine.evaluate_store_by_id(metric.store_id).await {
                warn!(store_id = metric.store_id, "Post-ingest evaluation error: {}", e);
            }

            let unclassified = is_unclassified(&metric);
            (
                StatusCode::OK,
                Json(json!({
                    "metric": metric,
                    "unclassified": unclassified,
                })),
            )
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct ResolveBody {
    resolution: String,
}

async fn api_resolve_store(
    State(state): State<DashboardState>,
    Path(code): Path<String>,
    Json(body): Json<ResolveBody>,
) -> impl IntoResponse {
    let store = match state.fleet.get_store_by_code(&code).await {
        Ok(Some(store)) => store,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("store not found: {}", code)})),
            );
        }
    };

    match state.engine.resolve_store(store.id, &body.resolution).await {
        Ok(resolved) => {
            info!(store = %store.store_code, resolved, "Resolve requested");
            (
                StatusCode::OK,
                Json(json!({"store_code": store.store_code, "resolved": resolved})),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

pub async fn start_dashboard_server(state: DashboardState, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = std::net::SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        port,
    );
    info!("Query API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
