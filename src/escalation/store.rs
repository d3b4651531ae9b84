//! Escalation persistence: the append-only audit log and the rule table.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::config::EscalationRuleSeedConfig;
use crate::kpi::store::parse_timestamp;

use super::{
    Escalation, EscalationAction, EscalationRule, EscalationStatus, EscalationTarget,
    EscalationTrigger,
};

/// Database operations for escalation audit rows and escalation rules.
///
/// The `escalations` table is append-only: rows are inserted and their
/// lifecycle status updated, but a level transition is never rewritten.
pub struct EscalationStore {
    pool: SqlitePool,
}

impl EscalationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== Audit log ====================

    /// Append one transition row. Callers hold the store's evaluation lock;
    /// the machine has already validated the transition.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_escalation(
        &self,
        store_id: i64,
        alert_id: Option<i64>,
        task_id: Option<i64>,
        from_level: i64,
        to_level: i64,
        trigger: EscalationTrigger,
        reason: &str,
        target: &EscalationTarget,
        status: EscalationStatus,
        resolution: Option<&str>,
    ) -> anyhow::Result<Escalation> {
        let now = Utc::now();
        let resolved_at = matches!(status, EscalationStatus::Resolved).then(|| now.to_rfc3339());

        let result = sqlx::query(
            "INSERT INTO escalations (
                store_id, alert_id, task_id, from_level, to_level,
                trigger_condition, reason, escalated_to_role, escalated_to_name,
                escalated_to_contact, status, resolution, resolved_at,
                escalated_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(store_id)
        .bind(alert_id)
        .bind(task_id)
        .bind(from_level)
        .bind(to_level)
        .bind(trigger.as_str())
        .bind(reason)
        .bind(&target.role)
        .bind(&target.name)
        .bind(&target.contact)
        .bind(status.as_str())
        .bind(resolution)
        .bind(resolved_at)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Escalation {
            id: result.last_insert_rowid(),
            store_id,
            alert_id,
            task_id,
            from_level,
            to_level,
            trigger,
            reason: reason.to_string(),
            escalated_to_role: target.role.clone(),
            escalated_to_name: target.name.clone(),
            escalated_to_contact: target.contact.clone(),
            status,
            resolution: resolution.map(str::to_string),
            resolved_at: matches!(status, EscalationStatus::Resolved).then_some(now),
            escalated_at: now,
        })
    }

    /// The store's current escalation level: the latest committed row's
    /// `to_level`, 0 if it has never escalated.
    pub async fn current_level(&self, store_id: i64) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT to_level FROM escalations WHERE store_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("to_level")).unwrap_or(0))
    }

    pub async fn get_escalation(&self, id: i64) -> anyhow::Result<Option<Escalation>> {
        let row = sqlx::query("SELECT * FROM escalations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_escalation(&row)?)),
            None => Ok(None),
        }
    }

    /// Transition history for a store, newest first.
    pub async fn history(&self, store_id: i64, limit: i64) -> anyhow::Result<Vec<Escalation>> {
        let rows = sqlx::query("SELECT * FROM escalations WHERE store_id = ? ORDER BY id DESC LIMIT ?")
            .bind(store_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut escalations = Vec::with_capacity(rows.len());
        for row in rows {
            escalations.push(row_to_escalation(&row)?);
        }
        Ok(escalations)
    }

    /// Open (pending or acknowledged) escalations across the fleet, highest
    /// level first.
    pub async fn list_open(&self) -> anyhow::Result<Vec<Escalation>> {
        let rows = sqlx::query(
            "SELECT * FROM escalations WHERE status IN ('pending', 'acknowledged')
             ORDER BY to_level DESC, escalated_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut escalations = Vec::with_capacity(rows.len());
        for row in rows {
            escalations.push(row_to_escalation(&row)?);
        }
        Ok(escalations)
    }

    /// Attach the remediation task created for a transition.
    pub async fn set_task(&self, escalation_id: i64, task_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE escalations SET task_id = ? WHERE id = ?")
            .bind(task_id)
            .bind(escalation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close every open escalation for a store. Called by the machine's
    /// resolve path after the audit row is written.
    pub async fn resolve_open_for_store(
        &self,
        store_id: i64,
        resolution: &str,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE escalations SET status = 'resolved', resolution = ?, resolved_at = ?
             WHERE store_id = ? AND status IN ('pending', 'acknowledged')",
        )
        .bind(resolution)
        .bind(Utc::now().to_rfc3339())
        .bind(store_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== Rules ====================

    /// Seed escalation rules from config (upsert by natural key, with the
    /// KPI code already resolved to a definition id by the caller).
    pub async fn seed_rules(
        &self,
        organization_id: i64,
        rules: &[(EscalationRuleSeedConfig, Option<i64>)],
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        for (seed, kpi_definition_id) in rules {
            let trigger = EscalationTrigger::parse(&seed.trigger);
            let action = EscalationAction::parse(&seed.action);

            match kpi_definition_id {
                None => {
                    sqlx::query(
                        "INSERT INTO escalation_rules (organization_id, kpi_definition_id, trigger_condition, duration_hours, from_level, to_level, action, is_active, created_at, updated_at)
                         VALUES (?, NULL, ?, ?, ?, ?, ?, 1, ?, ?)
                         ON CONFLICT(organization_id, trigger_condition, from_level, to_level) WHERE kpi_definition_id IS NULL DO UPDATE SET
                           duration_hours = excluded.duration_hours,
                           action = excluded.action,
                           is_active = 1,
                           updated_at = excluded.updated_at",
                    )
                    .bind(organization_id)
                    .bind(trigger.as_str())
                    .bind(seed.duration_hours)
                    .bind(seed.from_level)
                    .bind(seed.to_level)
                    .bind(action.as_str())
                    .bind(&now)
                    .bind(&now)
                    .execute(&self.pool)
                    .await?;
                }
                Some(kpi_id) => {
                    sqlx::query(
                        "INSERT INTO escalation_rules (organization_id, kpi_definition_id, trigger_condition, duration_hours, from_level, to_level, action, is_active, created_at, updated_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
                         ON CONFLICT(organization_id, kpi_definition_id, trigger_condition, from_level, to_level) WHERE kpi_definition_id IS NOT NULL DO UPDATE SET
                           duration_hours = excluded.duration_hours,
                           action = excluded.action,
                           is_active = 1,
                           updated_at = excluded.updated_at",
                    )
                    .bind(organization_id)
                    .bind(kpi_id)
                    .bind(trigger.as_str())
                    .bind(seed.duration_hours)
                    .bind(seed.from_level)
                    .bind(seed.to_level)
                    .bind(action.as_str())
                    .bind(&now)
                    .bind(&now)
                    .execute(&self.pool)
                    .await?;
                }
            }

            info!(
                trigger = %seed.trigger,
                from = seed.from_level,
                to = seed.to_level,
                action = %seed.action,
                "Seeded escalation rule"
            );
        }

        Ok(())
    }

    /// Active rules applicable to a store's driving KPI, specific rules
    /// before general ones so the evaluator's first match prefers them.
    pub async fn rules_for(
        &self,
        organization_id: i64,
        kpi_definition_id: Option<i64>,
    ) -> anyhow::Result<Vec<EscalationRule>> {
        let rows = match kpi_definition_id {
            Some(kpi_id) => {
                sqlx::query(
                    "SELECT * FROM escalation_rules
                     WHERE organization_id = ? AND is_active = 1
                       AND (kpi_definition_id = ? OR kpi_definition_id IS NULL)
                     ORDER BY kpi_definition_id IS NULL, from_level, id",
                )
                .bind(organization_id)
                .bind(kpi_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM escalation_rules
                     WHERE organization_id = ? AND is_active = 1 AND kpi_definition_id IS NULL
                     ORDER BY from_level, id",
                )
                .bind(organization_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    pub async fn count_rules(&self, organization_id: i64) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM escalation_rules WHERE organization_id = ?")
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn row_to_escalation(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Escalation> {
    let trigger: String = row.get("trigger_condition");
    let status: String = row.get("status");
    let escalated_at: String = row.get("escalated_at");
    let resolved_at: Option<String> = row.get("resolved_at");

    Ok(Escalation {
        id: row.get("id"),
        store_id: row.get("store_id"),
        alert_id: row.get("alert_id"),
        task_id: row.get("task_id"),
        from_level: row.get("from_level"),
        to_level: row.get("to_level"),
        trigger: EscalationTrigger::parse(&trigger),
        reason: row.get("reason"),
        escalated_to_role: row.get("escalated_to_role"),
        escalated_to_name: row.get("escalated_to_name"),
        escalated_to_contact: row.get("escalated_to_contact"),
        status: EscalationStatus::parse(&status),
        resolution: row.get("resolution"),
        resolved_at: resolved_at.map(|s| parse_timestamp(&s)),
        escalated_at: parse_timestamp(&escalated_at),
    })
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<EscalationRule> {
    let trigger: String = row.get("trigger_condition");
    let action: String = row.get("action");

    Ok(EscalationRule {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        kpi_definition_id: row.get("kpi_definition_id"),
        trigger: EscalationTrigger::parse(&trigger),
        duration_hours: row.get("duration_hours"),
        from_level: row.get("from_level"),
        to_level: row.get("to_level"),
        action: EscalationAction::parse(&action),
        is_active: row.get::<i64, _>("is_active") != 0,
    })
}

