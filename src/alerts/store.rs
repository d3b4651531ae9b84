//! Alert and task persistence.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use crate::kpi::store::parse_timestamp;

use super::{Alert, AlertSeverity, AlertStatus, Task, TaskStatus, TaskType};

const DATE_FMT: &str = "%Y-%m-%d";

/// Database operations for alerts.
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The live (active or acknowledged) alert for a store/KPI pair, if any.
    pub async fn get_live(
        &self,
        store_id: i64,
        kpi_definition_id: i64,
    ) -> anyhow::Result<Option<Alert>> {
        let row = sqlx::query(
            "SELECT * FROM alerts
             WHERE store_id = ? AND kpi_definition_id = ? AND status IN ('active', 'acknowledged')
             ORDER BY id DESC LIMIT 1",
        )
        .bind(store_id)
        .bind(kpi_definition_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_alert(&row)?)),
            None => Ok(None),
        }
    }

    /// Insert a new alert, deduplicated by the live-alert partial unique
    /// index: a concurrent insert for the same (store, KPI, day) collapses
    /// into an update of the surviving row. The existing row's `raised_at`
    /// and `expires_at` are kept so the SLA clock is never restarted by a
    /// re-evaluation pass.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_live(
        &self,
        store_id: i64,
        kpi_definition_id: i64,
        alert_day: NaiveDate,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        requires_acknowledgment: bool,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<Alert> {
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO alerts (
                store_id, kpi_definition_id, alert_day, raised_at, severity, status,
                title, message, requires_acknowledgment, expires_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?)
            ON CONFLICT(store_id, kpi_definition_id, alert_day) WHERE status IN ('active', 'acknowledged') DO UPDATE SET
                severity = excluded.severity,
                title = excluded.title,
                message = excluded.message,
                requires_acknowledgment = excluded.requires_acknowledgment,
                updated_at = excluded.updated_at",
        )
        .bind(store_id)
        .bind(kpi_definition_id)
        .bind(alert_day.format(DATE_FMT).to_string())
        .bind(now.to_rfc3339())
        .bind(severity.as_str())
        .bind(title)
        .bind(message)
        .bind(requires_acknowledgment as i64)
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_live(store_id, kpi_definition_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("alert missing after upsert"))
    }

    /// Refresh an existing live alert in place (severity may have worsened,
    /// the message carries the latest variance). Deadline and raise time
    /// keep the original clock.
    pub async fn refresh(
        &self,
        alert_id: i64,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        requires_acknowledgment: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE alerts SET severity = ?, title = ?, message = ?,
                 requires_acknowledgment = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(severity.as_str())
        .bind(title)
        .bind(message)
        .bind(requires_acknowledgment as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> anyhow::Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_alert(&row)?)),
            None => Ok(None),
        }
    }

    /// Live alerts for one store, most severe first, oldest within a tier.
    pub async fn list_live_for_store(&self, store_id: i64) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts
             WHERE store_id = ? AND status IN ('active', 'acknowledged')
             ORDER BY CASE severity WHEN 'red' THEN 0 ELSE 1 END, raised_at ASC",
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            alerts.push(row_to_alert(&row)?);
        }
        Ok(alerts)
    }

    /// Live alerts across the fleet.
    pub async fn list_live(&self) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE status IN ('active', 'acknowledged')
             ORDER BY CASE severity WHEN 'red' THEN 0 ELSE 1 END, raised_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            alerts.push(row_to_alert(&row)?);
        }
        Ok(alerts)
    }

    /// Live alerts whose SLA deadline has passed.
    pub async fn list_overdue(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM alerts
             WHERE status IN ('active', 'acknowledged') AND expires_at IS NOT NULL AND expires_at < ?
             ORDER BY expires_at ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            alerts.push(row_to_alert(&row)?);
        }
        Ok(alerts)
    }

    pub async fn acknowledge(&self, alert_id: i64, acknowledged_by: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?, acknowledged_by = ?, updated_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(acknowledged_by)
        .bind(Utc::now().to_rfc3339())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve(&self, alert_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('active', 'acknowledged')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve every live alert for a store (the resolve-to-level-0 cascade).
    pub async fn resolve_all_for_store(&self, store_id: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?, updated_at = ?
             WHERE store_id = ? AND status IN ('active', 'acknowledged')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(store_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Retire live alerts whose deadline passed more than `stale_hours` ago.
    /// Expiry is its own terminal status, never a silent resolve.
    pub async fn expire_stale(&self, now: DateTime<Utc>, stale_hours: u32) -> anyhow::Result<u64> {
        let cutoff = now - chrono::Duration::hours(stale_hours as i64);
        let result = sqlx::query(
            "UPDATE alerts SET status = 'expired', updated_at = ?
             WHERE status IN ('active', 'acknowledged') AND expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now.to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Database operations for tasks.
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        alert_id: Option<i64>,
        store_id: i64,
        kpi_definition_id: Option<i64>,
        escalation_id: Option<i64>,
        task_type: TaskType,
        priority: i64,
        title: &str,
        description: Option<&str>,
        assigned_to_role: &str,
        assigned_to_name: Option<&str>,
        assigned_to_contact: Option<&str>,
        due_date: DateTime<Utc>,
    ) -> anyhow::Result<Task> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO tasks (
                alert_id, store_id, kpi_definition_id, escalation_id, task_type, priority,
                title, description, assigned_to_role, assigned_to_name, assigned_to_contact,
                status, due_date, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
        )
        .bind(alert_id)
        .bind(store_id)
        .bind(kpi_definition_id)
        .bind(escalation_id)
        .bind(task_type.as_str())
        .bind(priority)
        .bind(title)
        .bind(description)
        .bind(assigned_to_role)
        .bind(assigned_to_name)
        .bind(assigned_to_contact)
        .bind(due_date.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Task {
            id: result.last_insert_rowid(),
            alert_id,
            store_id,
            kpi_definition_id,
            escalation_id,
            task_type,
            priority,
            title: title.to_string(),
            description: description.map(str::to_string),
            assigned_to_role: assigned_to_role.to_string(),
            assigned_to_name: assigned_to_name.map(str::to_string),
            assigned_to_contact: assigned_to_contact.map(str::to_string),
            status: TaskStatus::Pending,
            due_date,
            completed_at: None,
            completed_by: None,
            outcome: None,
        })
    }

    /// Open tasks for one store, most urgent first.
    pub async fn list_open_for_store(&self, store_id: i64) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE store_id = ? AND status IN ('pending', 'in_progress')
             ORDER BY priority ASC, due_date ASC",
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    /// Open tasks across the fleet.
    pub async fn list_open(&self) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN ('pending', 'in_progress')
             ORDER BY priority ASC, due_date ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    pub async fn complete(
        &self,
        task_id: i64,
        completed_by: &str,
        outcome: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = ?, completed_by = ?, outcome = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(completed_by)
        .bind(outcome)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Complete every open task hanging off an alert (resolve cascade).
    pub async fn complete_for_alert(&self, alert_id: i64, outcome: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = ?, outcome = ?, updated_at = ?
             WHERE alert_id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(outcome)
        .bind(Utc::now().to_rfc3339())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cancel every open task for a store (store resolved or closed).
    pub async fn cancel_open_for_store(&self, store_id: i64, outcome: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', outcome = ?, updated_at = ?
             WHERE store_id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(outcome)
        .bind(Utc::now().to_rfc3339())
        .bind(store_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Alert> {
    let alert_day: String = row.get("alert_day");
    let raised_at: String = row.get("raised_at");
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let acknowledged_at: Option<String> = row.get("acknowledged_at");
    let resolved_at: Option<String> = row.get("resolved_at");
    let expires_at: Option<String> = row.get("expires_at");

    Ok(Alert {
        id: row.get("id"),
        store_id: row.get("store_id"),
        kpi_definition_id: row.get("kpi_definition_id"),
        alert_day: NaiveDate::parse_from_str(&alert_day, DATE_FMT)?,
        raised_at: parse_timestamp(&raised_at),
        severity: AlertSeverity::parse(&severity),
        status: AlertStatus::parse(&status),
        title: row.get("title"),
        message: row.get("message"),
        requires_acknowledgment: row.get::<i64, _>("requires_acknowledgment") != 0,
        acknowledged_at: acknowledged_at.map(|s| parse_timestamp(&s)),
        acknowledged_by: row.get("acknowledged_by"),
        resolved_at: resolved_at.map(|s| parse_timestamp(&s)),
        expires_at: expires_at.map(|s| parse_timestamp(&s)),
    })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Task> {
    let task_type: String = row.get("task_type");
    let status: String = row.get("status");
    let due_date: String = row.get("due_date");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(Task {
        id: row.get("id"),
        alert_id: row.get("alert_id"),
        store_id: row.get("store_id"),
        kpi_definition_id: row.get("kpi_definition_id"),
        escalation_id: row.get("escalation_id"),
        task_type: TaskType::parse(&task_type),
        priority: row.get("priority"),
        title: row.get("title"),
        description: row.get("description"),
        assigned_to_role: row.get("assigned_to_role"),
        assigned_to_name: row.get("assigned_to_name"),
        assigned_to_contact: row.get("assigned_to_contact"),
        status: TaskStatus::parse(&status),
        due_date: parse_timestamp(&due_date),
        completed_at: completed_at.map(|s| parse_timestamp(&s)),
        completed_by: row.get("completed_by"),
        outcome: row.get("outcome"),
    })
}
