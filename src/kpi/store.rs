//! KPI storage: definitions, thresholds, metric facts, and snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::{
    ComparisonBasis, HealthSnapshot, KpiCategory, KpiDefinition, KpiMetric, KpiThreshold,
    MetricStatus,
};
use crate::config::KpiSeedConfig;

const DATE_FMT: &str = "%Y-%m-%d";

/// Database operations for KPI definitions, thresholds, metrics, and
/// daily health snapshots.
pub struct KpiStore {
    pool: SqlitePool,
}

impl KpiStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== Definitions ====================

    /// Seed KPI definitions from config (upsert by org + code).
    ///
    /// Definitions referenced by metrics are never deleted; entries missing
    /// from config are deactivated.
    pub async fn seed_definitions(
        &self,
        organization_id: i64,
        kpis: &[KpiSeedConfig],
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        for kpi in kpis {
            sqlx::query(
                "INSERT INTO kpi_definitions (organization_id, kpi_code, name, category, unit, calculation_method, is_active, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT(organization_id, kpi_code) DO UPDATE SET
                   name = excluded.name,
                   category = excluded.category,
                   unit = excluded.unit,
                   calculation_method = excluded.calculation_method,
                   is_active = 1,
                   updated_at = excluded.updated_at",
            )
            .bind(organization_id)
            .bind(&kpi.code)
            .bind(&kpi.name)
            .bind(KpiCategory::parse(&kpi.category).as_str())
            .bind(&kpi.unit)
            .bind(&kpi.calculation_method)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            info!(kpi = %kpi.code, "Seeded KPI definition");
        }

        if !kpis.is_empty() {
            let codes: Vec<&str> = kpis.iter().map(|k| k.code.as_str()).collect();
            let placeholders: Vec<String> = codes.iter().map(|_| "?".to_string()).collect();
            let query_str = format!(
                "UPDATE kpi_definitions SET is_active = 0, updated_at = ?
                 WHERE organization_id = ? AND is_active = 1 AND kpi_code NOT IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&query_str).bind(&now).bind(organization_id);
            for code in &codes {
                query = query.bind(code);
            }
            query.execute(&self.pool).await?;
        }

        Ok(())
    }

    pub async fn get_definition_by_code(
        &self,
        organization_id: i64,
        code: &str,
    ) -> anyhow::Result<Option<KpiDefinition>> {
        let row = sqlx::query(
            "SELECT * FROM kpi_definitions WHERE organization_id = ? AND kpi_code = ?",
        )
        .bind(organization_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row_to_definition(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_definitions(&self, organization_id: i64) -> anyhow::Result<Vec<KpiDefinition>> {
        let rows = sqlx::query(
            "SELECT * FROM kpi_definitions WHERE organization_id = ? AND is_active = 1 ORDER BY kpi_code",
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            definitions.push(row_to_definition(&row)?);
        }
        Ok(definitions)
    }

    // ==================== Thresholds ====================

    /// Upsert an org-wide default or a per-store override, depending on
    /// whether `store_id` is set.
    pub async fn upsert_threshold(
        &self,
        kpi_definition_id: i64,
        organization_id: i64,
        store_id: Option<i64>,
        green_min: f64,
        yellow_min: f64,
        red_threshold: f64,
        comparison_basis: ComparisonBasis,
        priority: i64,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        match store_id {
            None => {
                sqlx::query(
                    "INSERT INTO kpi_thresholds (kpi_definition_id, organization_id, store_id, green_min, yellow_min, red_threshold, comparison_basis, priority, created_at, updated_at)
                     VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(kpi_definition_id, organization_id) WHERE store_id IS NULL DO UPDATE SET
                       green_min = excluded.green_min,
                       yellow_min = excluded.yellow_min,
                       red_threshold = excluded.red_threshold,
                       comparison_basis = excluded.comparison_basis,
                       priority = excluded.priority,
                       updated_at = excluded.updated_at",
                )
                .bind(kpi_definition_id)
                .bind(organization_id)
                .bind(green_min)
                .bind(yellow_min)
                .bind(red_threshold)
                .bind(comparison_basis.as_str())
                .bind(priority)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;
            }
            Some(store_id) => {
                sqlx::query(
                    "INSERT INTO kpi_thresholds (kpi_definition_id, organization_id, store_id, green_min, yellow_min, red_threshold, comparison_basis, priority, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(kpi_definition_id, store_id) WHERE store_id IS NOT NULL DO UPDATE SET
                       green_min = excluded.green_min,
                       yellow_min = excluded.yellow_min,
                       red_threshold = excluded.red_threshold,
                       comparison_basis = excluded.comparison_basis,
                       priority = excluded.priority,
                       updated_at = excluded.updated_at",
                )
                .bind(kpi_definition_id)
                .bind(organization_id)
                .bind(store_id)
                .bind(green_min)
                .bind(yellow_min)
                .bind(red_threshold)
                .bind(comparison_basis.as_str())
                .bind(priority)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// The applicable threshold for a KPI at a store: the store-specific
    /// override if one exists, else the org-wide default, else None (and the
    /// classifier fails closed).
    pub async fn threshold_for(
        &self,
        kpi_definition_id: i64,
        organization_id: i64,
        store_id: i64,
    ) -> anyhow::Result<Option<KpiThreshold>> {
        let row = sqlx::query(
            "SELECT * FROM kpi_thresholds WHERE kpi_definition_id = ? AND store_id = ?",
        )
        .bind(kpi_definition_id)
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(row_to_threshold(&row)?));
        }

        let row = sqlx::query(
            "SELECT * FROM kpi_thresholds
             WHERE kpi_definition_id = ? AND organization_id = ? AND store_id IS NULL",
        )
        .bind(kpi_definition_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_threshold(&row)?)),
            None => Ok(None),
        }
    }

    // ==================== Metrics ====================

    /// Insert a metric fact. Rows are never updated in place; corrections
    /// are new rows and the latest wins at read time.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_metric(
        &self,
        store_id: i64,
        kpi_definition_id: i64,
        metric_date: NaiveDate,
        value: f64,
        comparison_value: Option<f64>,
        comparison_basis: Option<ComparisonBasis>,
        variance_pct: Option<f64>,
        status: MetricStatus,
    ) -> anyhow::Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO kpi_metrics (store_id, kpi_definition_id, metric_date, recorded_at, value, comparison_value, comparison_basis, variance_pct, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(store_id)
        .bind(kpi_definition_id)
        .bind(metric_date.format(DATE_FMT).to_string())
        .bind(now.to_rfc3339())
        .bind(value)
        .bind(comparison_value)
        .bind(comparison_basis.map(|b| b.as_str()))
        .bind(variance_pct)
        .bind(status.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// The winning (latest) metric row per KPI for a store and date.
    pub async fn latest_metrics_for_day(
        &self,
        store_id: i64,
        metric_date: NaiveDate,
    ) -> anyhow::Result<Vec<KpiMetric>> {
        let rows = sqlx::query(
            "SELECT m.* FROM kpi_metrics m
             JOIN (
                 SELECT kpi_definition_id, MAX(id) AS max_id
                 FROM kpi_metrics
                 WHERE store_id = ? AND metric_date = ?
                 GROUP BY kpi_definition_id
             ) latest ON m.id = latest.max_id
             ORDER BY m.kpi_definition_id",
        )
        .bind(store_id)
        .bind(metric_date.format(DATE_FMT).to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = Vec::with_capacity(rows.len());
        for row in rows {
            metrics.push(row_to_metric(&row)?);
        }
        Ok(metrics)
    }

    /// Recent winning metric rows for one KPI at a store, newest first.
    pub async fn metric_history(
        &self,
        store_id: i64,
        kpi_definition_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<KpiMetric>> {
        let rows = sqlx::query(
            "SELECT m.* FROM kpi_metrics m
             JOIN (
                 SELECT metric_date, MAX(id) AS max_id
                 FROM kpi_metrics
                 WHERE store_id = ? AND kpi_definition_id = ?
                 GROUP BY metric_date
             ) latest ON m.id = latest.max_id
             ORDER BY m.metric_date DESC
             LIMIT ?",
        )
        .bind(store_id)
        .bind(kpi_definition_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = Vec::with_capacity(rows.len());
        for row in rows {
            metrics.push(row_to_metric(&row)?);
        }
        Ok(metrics)
    }

    // ==================== Snapshots ====================

    /// Upsert the daily snapshot, keyed on (store_id, snapshot_date).
    pub async fn upsert_snapshot(&self, snapshot: &HealthSnapshot) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO store_health_snapshots (
                store_id, snapshot_date, overall_status, health_score,
                green_kpi_count, yellow_kpi_count, red_kpi_count, unknown_kpi_count,
                escalation_level, action_required, summary, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(store_id, snapshot_date) DO UPDATE SET
                overall_status = excluded.overall_status,
                health_score = excluded.health_score,
                green_kpi_count = excluded.green_kpi_count,
                yellow_kpi_count = excluded.yellow_kpi_count,
                red_kpi_count = excluded.red_kpi_count,
                unknown_kpi_count = excluded.unknown_kpi_count,
                escalation_level = excluded.escalation_level,
                action_required = excluded.action_required,
                summary = excluded.summary,
                updated_at = excluded.updated_at",
        )
        .bind(snapshot.store_id)
        .bind(snapshot.snapshot_date.format(DATE_FMT).to_string())
        .bind(snapshot.overall_status.as_str())
        .bind(snapshot.health_score)
        .bind(snapshot.green_kpi_count)
        .bind(snapshot.yellow_kpi_count)
        .bind(snapshot.red_kpi_count)
        .bind(snapshot.unknown_kpi_count)
        .bind(snapshot.escalation_level)
        .bind(snapshot.action_required as i64)
        .bind(&snapshot.summary)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_snapshot(
        &self,
        store_id: i64,
        snapshot_date: NaiveDate,
    ) -> anyhow::Result<Option<HealthSnapshot>> {
        let row = sqlx::query(
            "SELECT * FROM store_health_snapshots WHERE store_id = ? AND snapshot_date = ?",
        )
        .bind(store_id)
        .bind(snapshot_date.format(DATE_FMT).to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_snapshot(&row)?)),
            None => Ok(None),
        }
    }

    /// Recent snapshots for a store, newest first.
    pub async fn snapshot_history(
        &self,
        store_id: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<HealthSnapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM store_health_snapshots WHERE store_id = ?
             ORDER BY snapshot_date DESC LIMIT ?",
        )
        .bind(store_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            snapshots.push(row_to_snapshot(&row)?);
        }
        Ok(snapshots)
    }

    /// Write the committed escalation level onto an existing snapshot row.
    pub async fn set_snapshot_level(
        &self,
        store_id: i64,
        snapshot_date: NaiveDate,
        level: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE store_health_snapshots SET escalation_level = ?, updated_at = ?
             WHERE store_id = ? AND snapshot_date = ?",
        )
        .bind(level)
        .bind(Utc::now().to_rfc3339())
        .bind(store_id)
        .bind(snapshot_date.format(DATE_FMT).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_definition(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<KpiDefinition> {
    let category: String = row.get("category");
    Ok(KpiDefinition {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        kpi_code: row.get("kpi_code"),
        name: row.get("name"),
        category: KpiCategory::parse(&category),
        unit: row.get("unit"),
        calculation_method: row.get("calculation_method"),
        is_active: row.get::<i64, _>("is_active") != 0,
    })
}

fn row_to_threshold(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<KpiThreshold> {
    let basis: String = row.get("comparison_basis");
    Ok(KpiThreshold {
        id: row.get("id"),
        kpi_definition_id: row.get("kpi_definition_id"),
        organization_id: row.get("organization_id"),
        store_id: row.get("store_id"),
        green_min: row.get("green_min"),
        yellow_min: row.get("yellow_min"),
        red_threshold: row.get("red_threshold"),
        comparison_basis: ComparisonBasis::parse(&basis),
        priority: row.get("priority"),
    })
}

fn row_to_metric(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<KpiMetric> {
    let date_str: String = row.get("metric_date");
    let recorded_str: String = row.get("recorded_at");
    let status: String = row.get("status");
    let basis: Option<String> = row.get("comparison_basis");

    Ok(KpiMetric {
        id: row.get("id"),
        store_id: row.get("store_id"),
        kpi_definition_id: row.get("kpi_definition_id"),
        metric_date: NaiveDate::parse_from_str(&date_str, DATE_FMT)?,
        recorded_at: parse_timestamp(&recorded_str),
        value: row.get("value"),
        comparison_value: row.get("comparison_value"),
        comparison_basis: basis.map(|b| ComparisonBasis::parse(&b)),
        variance_pct: row.get("variance_pct"),
        status: MetricStatus::parse(&status),
    })
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<HealthSnapshot> {
    let date_str: String = row.get("snapshot_date");
    let status: String = row.get("overall_status");

    Ok(HealthSnapshot {
        store_id: row.get("store_id"),
        snapshot_date: NaiveDate::parse_from_str(&date_str, DATE_FMT)?,
        overall_status: MetricStatus::parse(&status),
        health_score: row.get("health_score"),
        green_kpi_count: row.get("green_kpi_count"),
        yellow_kpi_count: row.get("yellow_kpi_count"),
        red_kpi_count: row.get("red_kpi_count"),
        unknown_kpi_count: row.get("unknown_kpi_count"),
        escalation_level: row.get("escalation_level"),
        action_required: row.get::<i64, _>("action_required") != 0,
        summary: row.get::<Option<String>, _>("summary").unwrap_or_default(),
    })
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
