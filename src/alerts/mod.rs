//! Alerts and remediation tasks.
//!
//! An alert is raised when a metric crosses into yellow or red; at most one
//! live alert exists per (store, KPI, day). Tasks are the remediation units
//! fanned out from an alert through a small decision table.

pub mod manager;
pub mod store;
pub mod tasks;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::kpi::MetricStatus;

pub use manager::AlertManager;
pub use store::{AlertStore, TaskStore};
pub use tasks::TaskDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Yellow,
    Red,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Yellow => "yellow",
            AlertSeverity::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "red" => AlertSeverity::Red,
            _ => AlertSeverity::Yellow,
        }
    }

    /// Breaching metric statuses map to a severity; green and unknown
    /// never raise alerts.
    pub fn from_status(status: MetricStatus) -> Option<Self> {
        match status {
            MetricStatus::Red => Some(AlertSeverity::Red),
            MetricStatus::Yellow => Some(AlertSeverity::Yellow),
            MetricStatus::Green | MetricStatus::Unknown => None,
        }
    }

    pub fn metric_status(&self) -> MetricStatus {
        match self {
            AlertSeverity::Yellow => MetricStatus::Yellow,
            AlertSeverity::Red => MetricStatus::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Expired,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "acknowledged" => AlertStatus::Acknowledged,
            "resolved" => AlertStatus::Resolved,
            "expired" => AlertStatus::Expired,
            _ => AlertStatus::Active,
        }
    }

    /// Live alerts participate in dedup and SLA tracking.
    pub fn is_live(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub store_id: i64,
    pub kpi_definition_id: i64,
    pub alert_day: NaiveDate,
    pub raised_at: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub requires_acknowledgment: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// SLA deadline. Past this, the alert counts as breached and feeds the
    /// rule evaluator's `sla_breach` condition.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && self.expires_at.is_some_and(|deadline| deadline < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Review,
    Action,
    Escalation,
    FollowUp,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Review => "review",
            TaskType::Action => "action",
            TaskType::Escalation => "escalation",
            TaskType::FollowUp => "follow_up",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "action" => TaskType::Action,
            "escalation" => TaskType::Escalation,
            "follow_up" => TaskType::FollowUp,
            _ => TaskType::Review,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

/// A remediation unit, assigned to a role rather than a named person;
/// the name/contact fields are filled in when the hierarchy knows them.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub alert_id: Option<i64>,
    pub store_id: i64,
    pub kpi_definition_id: Option<i64>,
    pub escalation_id: Option<i64>,
    pub task_type: TaskType,
    /// 1 = most urgent.
    pub priority: i64,
    pub title: String,
    pub description: Option<String>,
    pub assigned_to_role: String,
    pub assigned_to_name: Option<String>,
    pub assigned_to_contact: Option<String>,
    pub status: TaskStatus,
    pub due_date: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub outcome: Option<String>,
}

impl Task {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.due_date < now
    }
}
