//! KPI domain types: definitions, thresholds, metrics, and daily snapshots.

pub mod aggregator;
pub mod classifier;
pub mod store;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use aggregator::{AggregationPolicy, Aggregator};
pub use classifier::{classify, Classification};
pub use store::KpiStore;

/// Operational category a KPI belongs to. Drives SLA hours and task routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiCategory {
    Sales,
    Traffic,
    Labor,
    Inventory,
    Operations,
}

impl KpiCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KpiCategory::Sales => "sales",
            KpiCategory::Traffic => "traffic",
            KpiCategory::Labor => "labor",
            KpiCategory::Inventory => "inventory",
            KpiCategory::Operations => "operations",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sales" => KpiCategory::Sales,
            "traffic" => KpiCategory::Traffic,
            "labor" | "labor_coverage" | "hr" => KpiCategory::Labor,
            "inventory" => KpiCategory::Inventory,
            _ => KpiCategory::Operations,
        }
    }
}

/// How the comparison baseline for a metric was derived. The ingestion
/// collaborator owns the computation; the engine only records which basis
/// was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonBasis {
    Rolling4w,
    SamePeriodLy,
    Absolute,
    Budget,
}

impl ComparisonBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonBasis::Rolling4w => "rolling_4w",
            ComparisonBasis::SamePeriodLy => "same_period_ly",
            ComparisonBasis::Absolute => "absolute",
            ComparisonBasis::Budget => "budget",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "same_period_ly" => ComparisonBasis::SamePeriodLy,
            "absolute" => ComparisonBasis::Absolute,
            "budget" => ComparisonBasis::Budget,
            _ => ComparisonBasis::Rolling4w,
        }
    }
}

/// Classified status of one metric.
///
/// The derived ordering is severity-ascending (red < yellow < green), which
/// the classifier's monotonicity property leans on. `Unknown` sits outside
/// the severity ladder: it marks a metric the engine could not classify and
/// is excluded from health-score denominators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Red,
    Yellow,
    Green,
    Unknown,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Red => "red",
            MetricStatus::Yellow => "yellow",
            MetricStatus::Green => "green",
            MetricStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "red" => MetricStatus::Red,
            "yellow" => MetricStatus::Yellow,
            "green" => MetricStatus::Green,
            _ => MetricStatus::Unknown,
        }
    }

    pub fn is_breach(&self) -> bool {
        matches!(self, MetricStatus::Red | MetricStatus::Yellow)
    }
}

/// A named, organization-scoped metric definition. Immutable once metrics
/// reference it; deactivated rather than deleted.
#[derive(Debug, Clone, Serialize)]
pub struct KpiDefinition {
    pub id: i64,
    pub organization_id: i64,
    pub kpi_code: String,
    pub name: String,
    pub category: KpiCategory,
    pub unit: String,
    pub calculation_method: Option<String>,
    pub is_active: bool,
}

/// Threshold boundaries for classifying a KPI's variance.
///
/// Reference ordering `red_threshold < yellow_min <= green_min` is enforced
/// by the classifier at evaluation time; operators may write any values.
#[derive(Debug, Clone, Serialize)]
pub struct KpiThreshold {
    pub id: i64,
    pub kpi_definition_id: i64,
    pub organization_id: i64,
    /// Store-specific override; None means the org-wide default.
    pub store_id: Option<i64>,
    pub green_min: f64,
    pub yellow_min: f64,
    pub red_threshold: f64,
    pub comparison_basis: ComparisonBasis,
    /// Escalation priority, 1 = highest.
    pub priority: i64,
}

impl KpiThreshold {
    /// Whether the boundaries satisfy the reference ordering.
    pub fn is_well_ordered(&self) -> bool {
        self.red_threshold < self.yellow_min && self.yellow_min <= self.green_min
    }
}

/// One immutable metric fact per (store, KPI, date). Corrections are new
/// rows with a later `recorded_at`; the latest row wins at read time.
#[derive(Debug, Clone, Serialize)]
pub struct KpiMetric {
    pub id: i64,
    pub store_id: i64,
    pub kpi_definition_id: i64,
    pub metric_date: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
    pub comparison_value: Option<f64>,
    pub comparison_basis: Option<ComparisonBasis>,
    pub variance_pct: Option<f64>,
    pub status: MetricStatus,
}

/// Daily health snapshot: the sole source of truth for "what is the store's
/// health today". Upserted once per store per day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub store_id: i64,
    pub snapshot_date: NaiveDate,
    pub overall_status: MetricStatus,
    pub health_score: f64,
    pub green_kpi_count: i64,
    pub yellow_kpi_count: i64,
    pub red_kpi_count: i64,
    pub unknown_kpi_count: i64,
    pub escalation_level: i64,
    pub action_required: bool,
    pub summary: String,
}
