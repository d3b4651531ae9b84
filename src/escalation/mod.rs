//! The escalation ladder: levels 0-4, rule evaluation, and the audited
//! state machine.
//!
//! Level 0 is normal monitoring; 1 = task created, 2 = alert active,
//! 3 = automated call triggered, 4 = regional escalation. Transitions only
//! move up, except an explicit resolve back to 0 that writes its own audit
//! row. The append-only `escalations` table is authoritative: the current
//! level of a store is a read of its latest committed row.

pub mod machine;
pub mod rules;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fleet::{Organization, Store};

pub use machine::EscalationMachine;
pub use rules::{ProposedTransition, RuleContext, RuleEvaluator};
pub use store::EscalationStore;

/// Highest rung of the ladder.
pub const MAX_LEVEL: i64 = 4;
/// Level at which the automated voice call fires.
pub const CALL_LEVEL: i64 = 3;

/// What set an escalation rule off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    StatusRed,
    StatusYellow,
    MultipleYellow,
    SlaBreach,
    PredictedRisk,
    /// Explicit operator action (resolve), never rule-driven.
    Manual,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTrigger::StatusRed => "status_red",
            EscalationTrigger::StatusYellow => "status_yellow",
            EscalationTrigger::MultipleYellow => "multiple_yellow",
            EscalationTrigger::SlaBreach => "sla_breach",
            EscalationTrigger::PredictedRisk => "predicted_risk",
            EscalationTrigger::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "status_red" => EscalationTrigger::StatusRed,
            "status_yellow" => EscalationTrigger::StatusYellow,
            "multiple_yellow" => EscalationTrigger::MultipleYellow,
            "predicted_risk" => EscalationTrigger::PredictedRisk,
            "manual" => EscalationTrigger::Manual,
            _ => EscalationTrigger::SlaBreach,
        }
    }
}

/// Side effect a committed transition asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    CreateTask,
    SendAlert,
    AiCall,
    RegionalEscalation,
}

impl EscalationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationAction::CreateTask => "create_task",
            EscalationAction::SendAlert => "send_alert",
            EscalationAction::AiCall => "ai_call",
            EscalationAction::RegionalEscalation => "regional_escalation",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "send_alert" => EscalationAction::SendAlert,
            "ai_call" => EscalationAction::AiCall,
            "regional_escalation" => EscalationAction::RegionalEscalation,
            _ => EscalationAction::CreateTask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Acknowledged => "acknowledged",
            EscalationStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "acknowledged" => EscalationStatus::Acknowledged,
            "resolved" => EscalationStatus::Resolved,
            _ => EscalationStatus::Pending,
        }
    }
}

/// One append-only audit row for a level transition.
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub id: i64,
    pub store_id: i64,
    pub alert_id: Option<i64>,
    pub task_id: Option<i64>,
    pub from_level: i64,
    pub to_level: i64,
    pub trigger: EscalationTrigger,
    pub reason: String,
    pub escalated_to_role: String,
    pub escalated_to_name: Option<String>,
    pub escalated_to_contact: Option<String>,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated_at: DateTime<Utc>,
}

/// Operator-configurable transition rule. Data, not code: SLAs are retuned
/// by editing rows, not redeploying.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRule {
    pub id: i64,
    pub organization_id: i64,
    /// KPI-specific rule; None applies to any KPI and loses to specific
    /// rules at evaluation time.
    pub kpi_definition_id: Option<i64>,
    pub trigger: EscalationTrigger,
    pub duration_hours: i64,
    pub from_level: i64,
    pub to_level: i64,
    pub action: EscalationAction,
    pub is_active: bool,
}

/// Who an escalation is addressed to.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationTarget {
    pub role: String,
    pub name: Option<String>,
    pub contact: Option<String>,
}

/// Pick the recipient for a given target level.
///
/// Levels 1-3 go to the store manager; level 4 climbs the hierarchy:
/// district manager, else region manager, else the organization's ops
/// contact.
pub fn escalation_target(store: &Store, org: &Organization, to_level: i64) -> EscalationTarget {
    if to_level >= MAX_LEVEL {
        if store.district_manager_name.is_some() {
            return EscalationTarget {
                role: "district_manager".to_string(),
                name: store.district_manager_name.clone(),
                contact: store.district_manager_phone.clone(),
            };
        }
        if store.region_manager_name.is_some() {
            return EscalationTarget {
                role: "regional_manager".to_string(),
                name: store.region_manager_name.clone(),
                contact: store.region_manager_phone.clone(),
            };
        }
        return EscalationTarget {
            role: "regional_ops".to_string(),
            name: org.ops_manager_name.clone(),
            contact: org
                .ops_manager_phone
                .clone()
                .or_else(|| org.ops_manager_email.clone()),
        };
    }

    EscalationTarget {
        role: "store_manager".to_string(),
        name: store.manager_name.clone(),
        contact: store
            .manager_phone
            .clone()
            .or_else(|| store.manager_email.clone()),
    }
}
