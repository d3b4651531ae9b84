//! Automated voice outreach: script rendering, the provider seam, and the
//! exactly-once trigger.

pub mod provider;
pub mod store;
pub mod trigger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use provider::{HttpVoiceProvider, VoiceProvider};
pub use store::CallStore;
pub use trigger::OutreachTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    /// The recipient never picked up. Terminal, and distinct from `Failed`:
    /// the provider did its job, the human was unavailable.
    NoAnswer,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Scheduled => "scheduled",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "in_progress" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "failed" => CallStatus::Failed,
            "no_answer" => CallStatus::NoAnswer,
            _ => CallStatus::Scheduled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::NoAnswer
        )
    }
}

/// How the manager answered the call's closing question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponse {
    /// Wants assistance now.
    Yes,
    /// Will handle it themselves.
    Later,
    NoAnswer,
    Other,
}

impl CallResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResponse::Yes => "yes",
            CallResponse::Later => "later",
            CallResponse::NoAnswer => "no_answer",
            CallResponse::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "yes" => CallResponse::Yes,
            "later" => CallResponse::Later,
            "no_answer" => CallResponse::NoAnswer,
            _ => CallResponse::Other,
        }
    }
}

/// The closed set of call scripts. A severity class picks a script; there
/// is no open-ended template lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Green,
    Yellow,
    Red,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Green => "green",
            ScriptKind::Yellow => "yellow",
            ScriptKind::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "green" => ScriptKind::Green,
            "red" => ScriptKind::Red,
            _ => ScriptKind::Yellow,
        }
    }

    /// Render the spoken script for this kind.
    pub fn render(&self, vars: &ScriptVars) -> String {
        let manager = vars.manager_name.as_deref().unwrap_or("there");
        match self {
            ScriptKind::Green => format!(
                "Good morning {manager}. Your store {store} is green across all core KPIs \
                 today, with a health score of {score:.0}. Sales, staffing, and inventory are \
                 tracking within healthy ranges. No action is required right now. I'll continue \
                 monitoring and notify you only if something changes.",
                manager = manager,
                store = vars.store_name,
                score = vars.health_score,
            ),
            ScriptKind::Yellow => format!(
                "Good morning {manager}. Here's your store status for {store}. One item needs \
                 attention. {kpi} is slightly below target at {variance:.1} percent variance, \
                 and the store's health score is {score:.0}. I've created a task to review this \
                 today. Would you like help taking action now, or will you handle it manually?",
                manager = manager,
                store = vars.store_name,
                kpi = vars.kpi_name,
                variance = vars.variance_pct,
                score = vars.health_score,
            ),
            ScriptKind::Red => format!(
                "Good morning {manager}. I'm calling because {store} is at risk today. {kpi} is \
                 below the safe threshold at {variance:.1} percent variance, and the store's \
                 health score has dropped to {score:.0}. If unaddressed, this may result in lost \
                 sales or customer impact. I've created a priority task that needs action now. \
                 Say 'yes' if you want me to assist, or 'later' if you'll handle it manually.",
                manager = manager,
                store = vars.store_name,
                kpi = vars.kpi_name,
                variance = vars.variance_pct,
                score = vars.health_score,
            ),
        }
    }
}

/// Variables a script is rendered with.
#[derive(Debug, Clone)]
pub struct ScriptVars {
    pub store_name: String,
    pub manager_name: Option<String>,
    pub kpi_name: String,
    pub variance_pct: f64,
    pub health_score: f64,
}

/// What the provider needs to place one call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub store_id: i64,
    pub escalation_id: i64,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub script_text: String,
}

/// The provider's acknowledgment of an initiated call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub external_call_id: String,
    pub initial_status: CallStatus,
}

/// Final call result, delivered by the provider's callback/poll contract.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: CallStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub transcript: Option<String>,
    pub sentiment: Option<String>,
    pub response: Option<CallResponse>,
}

/// One outreach attempt. At most one non-failed record exists per
/// escalation id; failed attempts may be retried as new rows.
#[derive(Debug, Clone, Serialize)]
pub struct AiCallRecord {
    pub id: i64,
    pub store_id: i64,
    pub alert_id: Option<i64>,
    pub task_id: Option<i64>,
    pub escalation_id: i64,
    pub call_type: ScriptKind,
    pub call_status: CallStatus,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub script_text: String,
    pub external_call_id: Option<String>,
    pub initiated_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub transcript: Option<String>,
    pub sentiment: Option<String>,
    pub response: Option<CallResponse>,
    pub follow_up_required: bool,
    /// 1-based attempt counter; retries after failure are new rows.
    pub attempt: i64,
    pub created_at: DateTime<Utc>,
}
