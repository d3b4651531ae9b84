//! Alert lifecycle: raise with dedup, acknowledge, resolve, expire.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::fleet::Store;
use crate::kpi::{KpiCategory, KpiDefinition, KpiMetric};

use super::store::{AlertStore, TaskStore};
use super::{Alert, AlertSeverity};

/// Outcome of a raise attempt: the live alert, and whether this pass
/// created it (false means an earlier pass already had, and the row was
/// refreshed in place).
pub struct RaisedAlert {
    pub alert: Alert,
    pub created: bool,
}

pub struct AlertManager {
    alerts: Arc<AlertStore>,
    tasks: Arc<TaskStore>,
}

impl AlertManager {
    pub fn new(alerts: Arc<AlertStore>, tasks: Arc<TaskStore>) -> Self {
        Self { alerts, tasks }
    }

    pub fn alerts(&self) -> &Arc<AlertStore> {
        &self.alerts
    }

    /// Raise (or refresh) the alert for a breaching metric.
    ///
    /// Green and unknown metrics return None. If the store/KPI pair already
    /// has a live alert, its severity and message are refreshed but its
    /// raise time and SLA deadline are left alone: repeated evaluation runs
    /// must not restart the escalation clock.
    pub async fn raise_for_metric(
        &self,
        store: &Store,
        definition: &KpiDefinition,
        metric: &KpiMetric,
    ) -> anyhow::Result<Option<RaisedAlert>> {
        let Some(severity) = AlertSeverity::from_status(metric.status) else {
            return Ok(None);
        };

        if let Some(existing) = self
            .alerts
            .get_live(store.id, definition.id)
            .await?
        {
            // Severity never downgrades on refresh: a metric that bounces
            // between red and yellow keeps its red alert until resolved.
            let severity = if existing.severity == AlertSeverity::Red {
                AlertSeverity::Red
            } else {
                severity
            };
            let title = alert_title(definition, metric, severity);
            let message = alert_message(store, definition, metric, severity);
            self.alerts
                .refresh(
                    existing.id,
                    severity,
                    &title,
                    &message,
                    severity == AlertSeverity::Red,
                )
                .await?;
            let alert = self
                .alerts
                .get(existing.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("alert {} vanished during refresh", existing.id))?;
            return Ok(Some(RaisedAlert {
                alert,
                created: false,
            }));
        }

        let title = alert_title(definition, metric, severity);
        let message = alert_message(store, definition, metric, severity);
        let sla_hours = sla_hours(definition.category, severity);
        let expires_at = Utc::now() + Duration::hours(sla_hours);

        let alert = self
            .alerts
            .upsert_live(
                store.id,
                definition.id,
                metric.metric_date,
                severity,
                &title,
                &message,
                severity == AlertSeverity::Red,
                expires_at,
            )
            .await?;

        info!(
            store = %store.store_code,
            kpi = %definition.kpi_code,
            severity = severity.as_str(),
            sla_hours,
            "Alert raised"
        );

        Ok(Some(RaisedAlert {
            alert,
            created: true,
        }))
    }

    pub async fn acknowledge(&self, alert_id: i64, acknowledged_by: &str) -> anyhow::Result<()> {
        self.alerts.acknowledge(alert_id, acknowledged_by).await?;
        info!(alert_id, by = acknowledged_by, "Alert acknowledged");
        Ok(())
    }

    /// Resolve an alert and complete its open tasks.
    pub async fn resolve(&self, alert_id: i64) -> anyhow::Result<()> {
        self.alerts.resolve(alert_id).await?;
        let completed = self
            .tasks
            .complete_for_alert(alert_id, "Alert resolved")
            .await?;
        info!(alert_id, completed_tasks = completed, "Alert resolved");
        Ok(())
    }

    /// Resolve every live alert for a store (the level-0 resolve cascade).
    pub async fn resolve_all_for_store(&self, store_id: i64) -> anyhow::Result<u64> {
        let alerts = self.alerts.list_live_for_store(store_id).await?;
        for alert in &alerts {
            self.tasks
                .complete_for_alert(alert.id, "Store resolved")
                .await?;
        }
        self.alerts.resolve_all_for_store(store_id).await
    }

    /// Retire long-overdue alerts. Called from the SLA pass.
    pub async fn expire_stale(&self, stale_hours: u32) -> anyhow::Result<u64> {
        let expired = self.alerts.expire_stale(Utc::now(), stale_hours).await?;
        if expired > 0 {
            warn!(count = expired, stale_hours, "Expired stale alerts");
        }
        Ok(expired)
    }
}

/// Response SLA in hours, by KPI category and severity. Inventory issues
/// get more runway than customer-facing metrics.
pub fn sla_hours(category: KpiCategory, severity: AlertSeverity) -> i64 {
    match (category, severity) {
        (KpiCategory::Inventory, AlertSeverity::Red) => 72,
        (KpiCategory::Inventory, AlertSeverity::Yellow) => 96,
        (_, AlertSeverity::Red) => 24,
        (_, AlertSeverity::Yellow) => 48,
    }
}

fn alert_title(definition: &KpiDefinition, metric: &KpiMetric, severity: AlertSeverity) -> String {
    let marker = match severity {
        AlertSeverity::Red => "\u{1F534}",
        AlertSeverity::Yellow => "\u{1F7E8}",
    };
    let variance = metric.variance_pct.unwrap_or(0.0);
    let direction = if variance < 0.0 { "below" } else { "above" };

    format!(
        "{} {} {:.1}% {} target",
        marker,
        definition.name,
        variance.abs(),
        direction
    )
}

fn alert_message(
    store: &Store,
    definition: &KpiDefinition,
    metric: &KpiMetric,
    severity: AlertSeverity,
) -> String {
    let variance = metric.variance_pct.unwrap_or(0.0);
    let direction = if variance < 0.0 { "below" } else { "above" };

    let mut message = format!(
        "{}: {} is {:.1}% {} the baseline.\n\nCurrent value: {} {}\n",
        store.name,
        definition.name,
        variance.abs(),
        direction,
        metric.value,
        definition.unit
    );

    if let Some(baseline) = metric.comparison_value {
        message.push_str(&format!("Baseline: {} {}\n", baseline, definition.unit));
    }
    message.push_str(&format!("Variance: {:.1}%\n\n", variance));

    match severity {
        AlertSeverity::Red => {
            message.push_str(
                "IMMEDIATE ACTION REQUIRED\nThis KPI has fallen into the red zone. \
                 Review and take corrective action immediately.",
            );
        }
        AlertSeverity::Yellow => {
            message.push_str(
                "ATTENTION NEEDED\nThis KPI requires monitoring. \
                 Consider preventive action to avoid further decline.",
            );
        }
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpi::{ComparisonBasis, MetricStatus};
    use chrono::NaiveDate;

    fn definition() -> KpiDefinition {
        KpiDefinition {
            id: 1,
            organization_id: 1,
            kpi_code: "sales".to_string(),
            name: "Net Sales".to_string(),
            category: KpiCategory::Sales,
            unit: "usd".to_string(),
            calculation_method: None,
            is_active: true,
        }
    }

    fn metric(status: MetricStatus, variance: f64) -> KpiMetric {
        KpiMetric {
            id: 1,
            store_id: 1,
            kpi_definition_id: 1,
            metric_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            recorded_at: Utc::now(),
            value: 70.0,
            comparison_value: Some(100.0),
            comparison_basis: Some(ComparisonBasis::Rolling4w),
            variance_pct: Some(variance),
            status,
        }
    }

    #[test]
    fn test_sla_hours_table() {
        assert_eq!(sla_hours(KpiCategory::Sales, AlertSeverity::Red), 24);
        assert_eq!(sla_hours(KpiCategory::Sales, AlertSeverity::Yellow), 48);
        assert_eq!(sla_hours(KpiCategory::Traffic, AlertSeverity::Red), 24);
        assert_eq!(sla_hours(KpiCategory::Labor, AlertSeverity::Yellow), 48);
        assert_eq!(sla_hours(KpiCategory::Inventory, AlertSeverity::Red), 72);
        assert_eq!(sla_hours(KpiCategory::Inventory, AlertSeverity::Yellow), 96);
    }

    #[test]
    fn test_alert_title_wording() {
        let title = alert_title(&definition(), &metric(MetricStatus::Red, -30.0), AlertSeverity::Red);
        assert!(title.contains("Net Sales"));
        assert!(title.contains("30.0% below target"));
    }

    #[test]
    fn test_alert_message_red_wording() {
        let store = Store {
            id: 1,
            organization_id: 1,
            store_code: "S001".to_string(),
            name: "Downtown".to_string(),
            timezone: "UTC".to_string(),
            region_name: None,
            region_manager_name: None,
            region_manager_phone: None,
            district_name: None,
            district_manager_name: None,
            district_manager_phone: None,
            manager_name: None,
            manager_phone: None,
            manager_email: None,
            status: crate::fleet::StoreStatus::Active,
        };

        let message = alert_message(
            &store,
            &definition(),
            &metric(MetricStatus::Red, -30.0),
            AlertSeverity::Red,
        );
        assert!(message.contains("Downtown"));
        assert!(message.contains("30.0% below the baseline"));
        assert!(message.contains("Baseline: 100 usd"));
        assert!(message.contains("IMMEDIATE ACTION REQUIRED"));

        let yellow = alert_message(
            &store,
            &definition(),
            &metric(MetricStatus::Yellow, -5.0),
            AlertSeverity::Yellow,
        );
        assert!(yellow.contains("ATTENTION NEEDED"));
    }
}
