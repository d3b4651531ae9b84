use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub organization: OrganizationConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub outreach: OutreachConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    /// Fleet seed: stores are onboarded by an external collaborator in
    /// production, but the daemon can bootstrap a fleet from config.
    #[serde(default)]
    pub stores: Vec<StoreSeedConfig>,
    #[serde(default)]
    pub kpis: Vec<KpiSeedConfig>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdSeedConfig>,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRuleSeedConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "storepulse.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrganizationConfig {
    #[serde(default = "default_org_name")]
    pub name: String,
    pub ops_manager_name: Option<String>,
    pub ops_manager_phone: Option<String>,
    pub ops_manager_email: Option<String>,
    /// Operator-supplied feature flags. The one genuinely open map in the
    /// system; everything else is typed.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            name: default_org_name(),
            ops_manager_name: None,
            ops_manager_phone: None,
            ops_manager_email: None,
            settings: HashMap::new(),
        }
    }
}

fn default_org_name() -> String {
    "Default Organization".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Full evaluation pass interval (aggregate -> alert -> escalate).
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// SLA timer pass interval. Runs more often than the full pass.
    #[serde(default = "default_sla_check_interval_secs")]
    pub sla_check_interval_secs: u64,
    /// Alerts whose deadline passed this long ago are retired as expired.
    #[serde(default = "default_stale_alert_hours")]
    pub stale_alert_hours: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval_secs(),
            sla_check_interval_secs: default_sla_check_interval_secs(),
            stale_alert_hours: default_stale_alert_hours(),
        }
    }
}

fn default_evaluation_interval_secs() -> u64 {
    900
}
fn default_sla_check_interval_secs() -> u64 {
    300
}
fn default_stale_alert_hours() -> u32 {
    168
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationConfig {
    #[serde(default = "default_green_weight")]
    pub green_weight: f64,
    #[serde(default = "default_yellow_weight")]
    pub yellow_weight: f64,
    #[serde(default = "default_red_weight")]
    pub red_weight: f64,
    /// Two simultaneous yellows count as an overall red. Inherited from the
    /// source system's seed logic; configurable so operators can retune the
    /// combination policy without a redeploy.
    #[serde(default = "default_yellow_pair_is_red")]
    pub yellow_pair_is_red: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            green_weight: default_green_weight(),
            yellow_weight: default_yellow_weight(),
            red_weight: default_red_weight(),
            yellow_pair_is_red: default_yellow_pair_is_red(),
        }
    }
}

fn default_green_weight() -> f64 {
    100.0
}
fn default_yellow_weight() -> f64 {
    60.0
}
fn default_red_weight() -> f64 {
    0.0
}
fn default_yellow_pair_is_red() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutreachConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_outreach_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub agent_phone_number_id: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_outreach_base_url(),
            api_key: String::new(),
            agent_id: String::new(),
            agent_phone_number_id: String::new(),
            call_timeout_secs: default_call_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

fn default_outreach_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_retry_backoff_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_enabled")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
    /// Optional bearer token for the query API. Unset means open access,
    /// intended for localhost-only deployments.
    pub bearer_token: Option<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: default_dashboard_enabled(),
            port: default_dashboard_port(),
            bearer_token: None,
        }
    }
}

fn default_dashboard_enabled() -> bool {
    true
}
fn default_dashboard_port() -> u16 {
    8090
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSeedConfig {
    pub store_code: String,
    pub name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub region_name: Option<String>,
    pub region_manager_name: Option<String>,
    pub region_manager_phone: Option<String>,
    pub district_name: Option<String>,
    pub district_manager_name: Option<String>,
    pub district_manager_phone: Option<String>,
    pub manager_name: Option<String>,
    pub manager_phone: Option<String>,
    pub manager_email: Option<String>,
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct KpiSeedConfig {
    pub code: String,
    pub name: String,
    pub category: String,
    #[serde(default = "default_kpi_unit")]
    pub unit: String,
    pub calculation_method: Option<String>,
}

fn default_kpi_unit() -> String {
    "count".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdSeedConfig {
    pub kpi_code: String,
    /// Store-specific override; absent means the org-wide default.
    pub store_code: Option<String>,
    pub green_min: f64,
    pub yellow_min: f64,
    pub red_threshold: f64,
    #[serde(default = "default_comparison_basis")]
    pub comparison_basis: String,
    #[serde(default = "default_threshold_priority")]
    pub priority: i64,
}

fn default_comparison_basis() -> String {
    "rolling_4w".to_string()
}
fn default_threshold_priority() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EscalationRuleSeedConfig {
    pub trigger: String,
    /// KPI-specific rule; absent means the rule applies to any KPI.
    pub kpi_code: Option<String>,
    pub duration_hours: i64,
    pub from_level: i64,
    pub to_level: i64,
    pub action: String,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// The escalation ladder used when the config lists no rules:
    /// sustained yellow opens a task, red raises an alert, a missed alert
    /// SLA triggers the automated call, and a second miss goes regional.
    pub fn default_escalation_rules() -> Vec<EscalationRuleSeedConfig> {
        vec![
            EscalationRuleSeedConfig {
                trigger: "status_yellow".to_string(),
                kpi_code: None,
                duration_hours: 24,
                from_level: 0,
                to_level: 1,
                action: "create_task".to_string(),
            },
            EscalationRuleSeedConfig {
                trigger: "status_red".to_string(),
                kpi_code: None,
                duration_hours: 4,
                from_level: 0,
                to_level: 2,
                action: "send_alert".to_string(),
            },
            EscalationRuleSeedConfig {
                trigger: "sla_breach".to_string(),
                kpi_code: None,
                duration_hours: 24,
                from_level: 2,
                to_level: 3,
                action: "ai_call".to_string(),
            },
            EscalationRuleSeedConfig {
                trigger: "sla_breach".to_string(),
                kpi_code: None,
                duration_hours: 48,
                from_level: 3,
                to_level: 4,
                action: "regional_escalation".to_string(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.state.db_path, "storepulse.db");
        assert_eq!(config.engine.evaluation_interval_secs, 900);
        assert_eq!(config.engine.sla_check_interval_secs, 300);
        assert_eq!(config.aggregation.green_weight, 100.0);
        assert!(config.aggregation.yellow_pair_is_red);
        assert!(!config.outreach.enabled);
        assert!(config.dashboard.enabled);
        assert!(config.stores.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [state]
            db_path = "/tmp/fleet.db"

            [organization]
            name = "Acme Retail"
            ops_manager_name = "Pat Ops"
            ops_manager_phone = "+15550100"

            [organization.settings]
            pilot_region = "northeast"

            [engine]
            evaluation_interval_secs = 60
            sla_check_interval_secs = 30

            [aggregation]
            yellow_weight = 50.0
            yellow_pair_is_red = false

            [outreach]
            enabled = true
            api_key = "key"
            agent_id = "agent"
            agent_phone_number_id = "phnum"

            [[stores]]
            store_code = "S001"
            name = "Downtown"
            manager_name = "Jamie"
            manager_phone = "+15550101"

            [[kpis]]
            code = "sales"
            name = "Net Sales"
            category = "sales"
            unit = "usd"

            [[thresholds]]
            kpi_code = "sales"
            green_min = -2.0
            yellow_min = -8.0
            red_threshold = -8.0

            [[escalation_rules]]
            trigger = "status_red"
            duration_hours = 48
            from_level = 0
            to_level = 2
            action = "send_alert"
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.organization.name, "Acme Retail");
        assert_eq!(
            config.organization.settings.get("pilot_region").unwrap(),
            "northeast"
        );
        assert_eq!(config.engine.evaluation_interval_secs, 60);
        assert_eq!(config.aggregation.yellow_weight, 50.0);
        assert!(!config.aggregation.yellow_pair_is_red);
        assert!(config.outreach.enabled);
        assert_eq!(config.stores.len(), 1);
        assert_eq!(config.kpis.len(), 1);
        assert_eq!(config.thresholds.len(), 1);
        assert_eq!(config.escalation_rules.len(), 1);
    }

    #[test]
    fn test_default_escalation_ladder() {
        let rules = AppConfig::default_escalation_rules();
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().any(|r| r.from_level == 0 && r.to_level == 1));
        assert!(rules.iter().any(|r| r.from_level == 0 && r.to_level == 2));
        assert!(rules.iter().any(|r| r.from_level == 2 && r.to_level == 3));
        assert!(rules.iter().any(|r| r.from_level == 3 && r.to_level == 4));
        assert_eq!(rules.iter().filter(|r| r.action == "ai_call").count(), 1);
    }
}
