use sqlx::SqlitePool;
use tracing::info;

/// Centralized database migrations for all SQLite-backed stores.
///
/// Each migration is safe to call multiple times (idempotent) via
/// `IF NOT EXISTS`. The uniqueness invariants the engine leans on live here,
/// at the storage layer, not only in application code:
/// one snapshot per (store, date), one active alert per (store, KPI, day),
/// one non-failed call per escalation.
pub(crate) async fn migrate_all(pool: &SqlitePool) -> anyhow::Result<()> {
    migrate_fleet(pool).await?;
    migrate_kpis(pool).await?;
    migrate_alerts(pool).await?;
    migrate_escalations(pool).await?;
    migrate_calls(pool).await?;
    Ok(())
}

pub(crate) async fn migrate_fleet(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            ops_manager_name TEXT,
            ops_manager_phone TEXT,
            ops_manager_email TEXT,
            settings TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL,
            store_code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'America/New_York',
            region_name TEXT,
            region_manager_name TEXT,
            region_manager_phone TEXT,
            district_name TEXT,
            district_manager_name TEXT,
            district_manager_phone TEXT,
            manager_name TEXT,
            manager_phone TEXT,
            manager_email TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stores_status ON stores(status)")
        .execute(pool)
        .await?;

    info!("Fleet tables migration complete");
    Ok(())
}

pub(crate) async fn migrate_kpis(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kpi_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL,
            kpi_code TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            unit TEXT NOT NULL DEFAULT 'count',
            calculation_method TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(organization_id, kpi_code)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kpi_thresholds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kpi_definition_id INTEGER NOT NULL,
            organization_id INTEGER NOT NULL,
            store_id INTEGER,
            green_min REAL NOT NULL,
            yellow_min REAL NOT NULL,
            red_threshold REAL NOT NULL,
            comparison_basis TEXT NOT NULL DEFAULT 'rolling_4w',
            priority INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One org-wide default per KPI, one override per (KPI, store).
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_thresholds_org_default
         ON kpi_thresholds(kpi_definition_id, organization_id) WHERE store_id IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_thresholds_store_override
         ON kpi_thresholds(kpi_definition_id, store_id) WHERE store_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    // Metrics are immutable facts; corrections are new rows and the latest
    // row per (store, KPI, date) wins at read time.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kpi_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id INTEGER NOT NULL,
            kpi_definition_id INTEGER NOT NULL,
            metric_date TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            value REAL NOT NULL,
            comparison_value REAL,
            comparison_basis TEXT,
            variance_pct REAL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_metrics_store_date
         ON kpi_metrics(store_id, metric_date, kpi_definition_id, recorded_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_health_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id INTEGER NOT NULL,
            snapshot_date TEXT NOT NULL,
            overall_status TEXT NOT NULL,
            health_score REAL NOT NULL DEFAULT 100,
            green_kpi_count INTEGER NOT NULL DEFAULT 0,
            yellow_kpi_count INTEGER NOT NULL DEFAULT 0,
            red_kpi_count INTEGER NOT NULL DEFAULT 0,
            unknown_kpi_count INTEGER NOT NULL DEFAULT 0,
            escalation_level INTEGER NOT NULL DEFAULT 0,
            action_required INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(store_id, snapshot_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_date
         ON store_health_snapshots(snapshot_date, overall_status)",
    )
    .execute(pool)
    .await?;

    info!("KPI tables migration complete");
    Ok(())
}

pub(crate) async fn migrate_alerts(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id INTEGER NOT NULL,
            kpi_definition_id INTEGER NOT NULL,
            alert_day TEXT NOT NULL,
            raised_at TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            requires_acknowledgment INTEGER NOT NULL DEFAULT 0,
            acknowledged_at TEXT,
            acknowledged_by TEXT,
            resolved_at TEXT,
            expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The dedup backstop: repeated evaluation passes (or concurrent ones)
    // cannot produce two live alerts for the same store/KPI/day.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_live_dedup
         ON alerts(store_id, kpi_definition_id, alert_day)
         WHERE status IN ('active', 'acknowledged')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alerts_store_status
         ON alerts(store_id, status, raised_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alerts_expiry
         ON alerts(expires_at) WHERE status IN ('active', 'acknowledged')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            alert_id INTEGER,
            store_id INTEGER NOT NULL,
            kpi_definition_id INTEGER,
            escalation_id INTEGER,
            task_type TEXT NOT NULL DEFAULT 'review',
            priority INTEGER NOT NULL DEFAULT 3,
            title TEXT NOT NULL,
            description TEXT,
            assigned_to_role TEXT NOT NULL,
            assigned_to_name TEXT,
            assigned_to_contact TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            due_date TEXT NOT NULL,
            completed_at TEXT,
            completed_by TEXT,
            outcome TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_store_status
         ON tasks(store_id, status, due_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_alert ON tasks(alert_id)")
        .execute(pool)
        .await?;

    info!("Alert and task tables migration complete");
    Ok(())
}

pub(crate) async fn migrate_escalations(pool: &SqlitePool) -> anyhow::Result<()> {
    // Append-only audit log. The current level of a store is a read of the
    // latest row here, never a separately-mutated counter.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS escalations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id INTEGER NOT NULL,
            alert_id INTEGER,
            task_id INTEGER,
            from_level INTEGER NOT NULL,
            to_level INTEGER NOT NULL,
            trigger_condition TEXT NOT NULL,
            reason TEXT NOT NULL,
            escalated_to_role TEXT NOT NULL,
            escalated_to_name TEXT,
            escalated_to_contact TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            resolution TEXT,
            resolved_at TEXT,
            escalated_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_escalations_store
         ON escalations(store_id, id DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_escalations_alert ON escalations(alert_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS escalation_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL,
            kpi_definition_id INTEGER,
            trigger_condition TEXT NOT NULL,
            duration_hours INTEGER NOT NULL,
            from_level INTEGER NOT NULL,
            to_level INTEGER NOT NULL,
            action TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Seed upsert keys: one org-wide rule per rung and trigger, one
    // KPI-specific rule per (KPI, rung, trigger). A specific rule may
    // coexist with a general rule for the same rung.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_general
         ON escalation_rules(organization_id, trigger_condition, from_level, to_level)
         WHERE kpi_definition_id IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_kpi
         ON escalation_rules(organization_id, kpi_definition_id, trigger_condition, from_level, to_level)
         WHERE kpi_definition_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    info!("Escalation tables migration complete");
    Ok(())
}

pub(crate) async fn migrate_calls(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_calls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            store_id INTEGER NOT NULL,
            alert_id INTEGER,
            task_id INTEGER,
            escalation_id INTEGER NOT NULL,
            call_type TEXT NOT NULL,
            call_status TEXT NOT NULL DEFAULT 'scheduled',
            recipient_name TEXT NOT NULL,
            recipient_phone TEXT NOT NULL,
            script_text TEXT NOT NULL,
            external_call_id TEXT,
            initiated_at TEXT,
            connected_at TEXT,
            ended_at TEXT,
            duration_seconds INTEGER,
            transcript TEXT,
            sentiment TEXT,
            response TEXT,
            follow_up_required INTEGER NOT NULL DEFAULT 0,
            attempt INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Exactly-once outreach per escalation: failed attempts may be retried
    // as new rows, anything else claims the escalation id.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_escalation_once
         ON ai_calls(escalation_id) WHERE call_status != 'failed'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_calls_store
         ON ai_calls(store_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    info!("AI call tables migration complete");
    Ok(())
}
