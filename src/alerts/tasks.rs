//! Task dispatch: turn alerts and escalations into role-assigned work.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::escalation::Escalation;
use crate::fleet::Store;
use crate::kpi::{KpiCategory, KpiDefinition};

use super::store::TaskStore;
use super::{Alert, AlertSeverity, Task, TaskType};

/// One row of the dispatch decision table.
struct Dispatch {
    task_type: TaskType,
    role: &'static str,
    title: String,
}

pub struct TaskDispatcher {
    tasks: Arc<TaskStore>,
}

impl TaskDispatcher {
    pub fn new(tasks: Arc<TaskStore>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Fan an alert out into its remediation tasks.
    ///
    /// Routing is a decision table keyed on (KPI category, severity): a red
    /// inventory issue goes to the inventory manager, a red sales issue
    /// additionally pulls in the district manager, and anything yellow is a
    /// review for the store manager.
    pub async fn dispatch_for_alert(
        &self,
        store: &Store,
        definition: &KpiDefinition,
        alert: &Alert,
    ) -> anyhow::Result<Vec<Task>> {
        let due_date = alert
            .expires_at
            .unwrap_or_else(|| Utc::now() + Duration::hours(24));
        let priority = match alert.severity {
            AlertSeverity::Red => 1,
            AlertSeverity::Yellow => 3,
        };
        let description = task_description(definition, alert);

        let mut created = Vec::new();
        for dispatch in decision_table(definition.category, alert.severity, &definition.name) {
            let (name, contact) = assignee(store, dispatch.role);
            let task = self
                .tasks
                .insert(
                    Some(alert.id),
                    store.id,
                    Some(definition.id),
                    None,
                    dispatch.task_type,
                    priority,
                    &dispatch.title,
                    Some(&description),
                    dispatch.role,
                    name.as_deref(),
                    contact.as_deref(),
                    due_date,
                )
                .await?;

            info!(
                store = %store.store_code,
                kpi = %definition.kpi_code,
                task_id = task.id,
                role = dispatch.role,
                "Task dispatched for alert"
            );
            created.push(task);
        }

        Ok(created)
    }

    /// High-priority task for a committed escalation. Level 3+ gets a
    /// six-hour clock; lower rungs get a day.
    pub async fn create_escalation_task(
        &self,
        store: &Store,
        escalation: &Escalation,
        kpi_definition_id: Option<i64>,
        kpi_name: &str,
    ) -> anyhow::Result<Task> {
        let urgent = escalation.to_level >= 3;
        let due_date = Utc::now() + Duration::hours(if urgent { 6 } else { 24 });

        let task = self
            .tasks
            .insert(
                escalation.alert_id,
                store.id,
                kpi_definition_id,
                Some(escalation.id),
                TaskType::Escalation,
                if urgent { 1 } else { 2 },
                &format!("ESCALATED: {} - Level {}", kpi_name, escalation.to_level),
                Some(&format!(
                    "This issue has been escalated to level {}.\n\n{}\n\nImmediate action required.",
                    escalation.to_level, escalation.reason
                )),
                &escalation.escalated_to_role,
                escalation.escalated_to_name.as_deref(),
                escalation.escalated_to_contact.as_deref(),
                due_date,
            )
            .await?;

        info!(
            store = %store.store_code,
            escalation_id = escalation.id,
            level = escalation.to_level,
            task_id = task.id,
            "Escalation task created"
        );

        Ok(task)
    }

    /// Follow-up after an outreach call that did not land (failed or went
    /// unanswered): a human picks up where the machine left off.
    pub async fn create_call_follow_up(
        &self,
        store: &Store,
        escalation: &Escalation,
        call_outcome: &str,
    ) -> anyhow::Result<Task> {
        let task = self
            .tasks
            .insert(
                escalation.alert_id,
                store.id,
                None,
                Some(escalation.id),
                TaskType::FollowUp,
                1,
                &format!("Call {} - contact {} manually", call_outcome, store.name),
                Some(&format!(
                    "The automated call for escalation {} ended as '{}'. \
                     Reach the store manager directly and confirm the remediation plan.",
                    escalation.id, call_outcome
                )),
                "district_manager",
                store.district_manager_name.as_deref(),
                store.district_manager_phone.as_deref(),
                Utc::now() + Duration::hours(4),
            )
            .await?;

        info!(
            store = %store.store_code,
            escalation_id = escalation.id,
            outcome = call_outcome,
            task_id = task.id,
            "Call follow-up task created"
        );

        Ok(task)
    }
}

fn decision_table(category: KpiCategory, severity: AlertSeverity, kpi_name: &str) -> Vec<Dispatch> {
    match (category, severity) {
        (KpiCategory::Inventory, AlertSeverity::Red) => vec![Dispatch {
            task_type: TaskType::Review,
            role: "inventory_manager",
            title: "Review Inventory".to_string(),
        }],
        (KpiCategory::Sales, AlertSeverity::Red) => vec![
            Dispatch {
                task_type: TaskType::Action,
                role: "district_manager",
                title: "Contact Store Manager".to_string(),
            },
            Dispatch {
                task_type: TaskType::Review,
                role: "store_manager",
                title: "Review Sales Performance".to_string(),
            },
        ],
        (KpiCategory::Labor, AlertSeverity::Red) => vec![Dispatch {
            task_type: TaskType::Action,
            role: "store_manager",
            title: "Cover Open Shifts".to_string(),
        }],
        (KpiCategory::Traffic, AlertSeverity::Red) => vec![Dispatch {
            task_type: TaskType::Action,
            role: "store_manager",
            title: "Drive Store Traffic".to_string(),
        }],
        (KpiCategory::Operations, AlertSeverity::Red) => vec![Dispatch {
            task_type: TaskType::Action,
            role: "store_manager",
            title: format!("Address {}", kpi_name),
        }],
        (_, AlertSeverity::Yellow) => vec![Dispatch {
            task_type: TaskType::Review,
            role: "store_manager",
            title: format!("Review {}", kpi_name),
        }],
    }
}

/// Resolve a role to the person the store hierarchy knows for it, if any.
/// Tasks stay role-assigned either way.
fn assignee(store: &Store, role: &str) -> (Option<String>, Option<String>) {
    match role {
        "store_manager" => (
            store.manager_name.clone(),
            store
                .manager_phone
                .clone()
                .or_else(|| store.manager_email.clone()),
        ),
        "district_manager" => (
            store.district_manager_name.clone(),
            store.district_manager_phone.clone(),
        ),
        _ => (None, None),
    }
}

fn task_description(definition: &KpiDefinition, alert: &Alert) -> String {
    let actions = recommended_actions(definition.category);
    let checklist: Vec<String> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| format!("{}. {}", i + 1, action))
        .collect();

    format!(
        "{} is tracking {} status.\n\nRecommended actions:\n{}",
        definition.name,
        alert.severity.as_str().to_uppercase(),
        checklist.join("\n")
    )
}

/// Remediation checklist per KPI category, rendered into task descriptions.
fn recommended_actions(category: KpiCategory) -> &'static [&'static str] {
    match category {
        KpiCategory::Sales => &[
            "Review current promotions and pricing",
            "Check inventory availability for top SKUs",
            "Analyze traffic patterns and conversion rates",
            "Consider targeted marketing campaigns",
        ],
        KpiCategory::Traffic => &[
            "Review store hours and scheduling",
            "Check local events and competition",
            "Assess storefront visibility and signage",
            "Consider promotional activities to drive traffic",
        ],
        KpiCategory::Labor => &[
            "Fill open shifts immediately",
            "Contact backup staff for coverage",
            "Review schedule for next 48 hours",
            "Escalate to district if unable to cover",
        ],
        KpiCategory::Inventory => &[
            "Review out-of-stock items",
            "Expedite replenishment for top SKUs",
            "Check pending deliveries and orders",
            "Contact distribution center if delays",
        ],
        KpiCategory::Operations => &[
            "Review current performance trends",
            "Identify root cause of variance",
            "Implement corrective actions",
            "Monitor closely over next 24 hours",
        ],
    }
}
