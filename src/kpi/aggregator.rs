//! Daily health aggregation: fold a store's classified metrics into one
//! snapshot row.

use chrono::NaiveDate;

use super::{HealthSnapshot, KpiDefinition, KpiMetric, MetricStatus};
use crate::config::AggregationConfig;

/// Status weights and the yellow-combination rule.
///
/// The "two yellows behave like one red" pairing prevents a store from
/// staying "mostly fine" while several KPIs degrade at once. It ships on by
/// default but stays configurable.
#[derive(Debug, Clone, Copy)]
pub struct AggregationPolicy {
    pub green_weight: f64,
    pub yellow_weight: f64,
    pub red_weight: f64,
    pub yellow_pair_is_red: bool,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            green_weight: 100.0,
            yellow_weight: 60.0,
            red_weight: 0.0,
            yellow_pair_is_red: true,
        }
    }
}

impl From<&AggregationConfig> for AggregationPolicy {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            green_weight: config.green_weight,
            yellow_weight: config.yellow_weight,
            red_weight: config.red_weight,
            yellow_pair_is_red: config.yellow_pair_is_red,
        }
    }
}

/// Computes `HealthSnapshot`s from classified metrics. Pure: persistence is
/// the caller's job, which keeps recomputation trivially idempotent.
pub struct Aggregator {
    policy: AggregationPolicy,
}

impl Aggregator {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self { policy }
    }

    /// Fold one day's metrics for a store into a snapshot.
    ///
    /// `unknown` metrics are excluded from the score denominator but are
    /// tallied and flagged in the summary so degraded inputs stay visible.
    /// `definitions` is used only for summary wording; metrics without a
    /// matching definition fall back to their KPI id.
    pub fn aggregate(
        &self,
        store_id: i64,
        snapshot_date: NaiveDate,
        metrics: &[KpiMetric],
        definitions: &[KpiDefinition],
        escalation_level: i64,
    ) -> HealthSnapshot {
        let mut green = 0i64;
        let mut yellow = 0i64;
        let mut red = 0i64;
        let mut unknown = 0i64;

        for metric in metrics {
            match metric.status {
                MetricStatus::Green => green += 1,
                MetricStatus::Yellow => yellow += 1,
                MetricStatus::Red => red += 1,
                MetricStatus::Unknown => unknown += 1,
            }
        }

        let counted = green + yellow + red;
        let health_score = if counted == 0 {
            100.0
        } else {
            let total = green as f64 * self.policy.green_weight
                + yellow as f64 * self.policy.yellow_weight
                + red as f64 * self.policy.red_weight;
            let score = (total / counted as f64).clamp(0.0, 100.0);
            // Two decimal places: keeps recomputed snapshots byte-identical.
            (score * 100.0).round() / 100.0
        };

        let overall_status = self.overall_status(red, yellow);
        let action_required = overall_status != MetricStatus::Green || unknown > 0;
        let summary = self.summary(metrics, definitions, overall_status, green, yellow, red, unknown);

        HealthSnapshot {
            store_id,
            snapshot_date,
            overall_status,
            health_score,
            green_kpi_count: green,
            yellow_kpi_count: yellow,
            red_kpi_count: red,
            unknown_kpi_count: unknown,
            escalation_level,
            action_required,
            summary,
        }
    }

    fn overall_status(&self, red: i64, yellow: i64) -> MetricStatus {
        if red > 0 {
            return MetricStatus::Red;
        }
        if self.policy.yellow_pair_is_red && yellow >= 2 {
            return MetricStatus::Red;
        }
        if yellow >= 1 {
            return MetricStatus::Yellow;
        }
        MetricStatus::Green
    }

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        metrics: &[KpiMetric],
        definitions: &[KpiDefinition],
        overall: MetricStatus,
        green: i64,
        yellow: i64,
        red: i64,
        unknown: i64,
    ) -> String {
        let kpi_name = |id: i64| -> String {
            definitions
                .iter()
                .find(|d| d.id == id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("KPI {}", id))
        };

        let mut text = match overall {
            MetricStatus::Green => format!(
                "Store is healthy. All {} tracked KPIs are within normal ranges.",
                green
            ),
            MetricStatus::Yellow => {
                let concern = metrics
                    .iter()
                    .find(|m| m.status == MetricStatus::Yellow)
                    .map(|m| {
                        format!(
                            "{} is {:.1}% off baseline",
                            kpi_name(m.kpi_definition_id),
                            m.variance_pct.unwrap_or(0.0)
                        )
                    })
                    .unwrap_or_else(|| "One KPI is below target".to_string());
                format!("Store has one area of concern. {}. Review recommended.", concern)
            }
            MetricStatus::Red => {
                let mut issues: Vec<String> = metrics
                    .iter()
                    .filter(|m| m.status == MetricStatus::Red)
                    .map(|m| {
                        format!(
                            "{} is critical ({:.1}% variance)",
                            kpi_name(m.kpi_definition_id),
                            m.variance_pct.unwrap_or(0.0)
                        )
                    })
                    .collect();
                if yellow >= 2 {
                    issues.push(format!("{} KPIs below target", yellow));
                }
                if issues.is_empty() {
                    issues.push(format!(
                        "{} green, {} yellow, {} red KPIs",
                        green, yellow, red
                    ));
                }
                format!(
                    "Store requires immediate attention. {}.",
                    issues.join(". ")
                )
            }
            MetricStatus::Unknown => {
                format!("{} green, {} yellow, {} red KPIs.", green, yellow, red)
            }
        };

        if unknown > 0 {
            let gaps: Vec<String> = metrics
                .iter()
                .filter(|m| m.status == MetricStatus::Unknown)
                .map(|m| kpi_name(m.kpi_definition_id))
                .collect();
            text.push_str(&format!(
                " {} KPI(s) could not be classified (no usable threshold): {}.",
                unknown,
                gaps.join(", ")
            ));
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kpi::{ComparisonBasis, KpiCategory};
    use chrono::Utc;

    fn metric(kpi_id: i64, status: MetricStatus, variance: f64) -> KpiMetric {
        KpiMetric {
            id: 0,
            store_id: 1,
            kpi_definition_id: kpi_id,
            metric_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            recorded_at: Utc::now(),
            value: 0.0,
            comparison_value: Some(100.0),
            comparison_basis: Some(ComparisonBasis::Rolling4w),
            variance_pct: if status == MetricStatus::Unknown {
                None
            } else {
                Some(variance)
            },
            status,
        }
    }

    fn definition(id: i64, name: &str) -> KpiDefinition {
        KpiDefinition {
            id,
            organization_id: 1,
            kpi_code: name.to_lowercase(),
            name: name.to_string(),
            category: KpiCategory::Sales,
            unit: "usd".to_string(),
            calculation_method: None,
            is_active: true,
        }
    }

    fn aggregate(metrics: &[KpiMetric]) -> HealthSnapshot {
        let defs = vec![
            definition(1, "Net Sales"),
            definition(2, "Traffic"),
            definition(3, "Labor Coverage"),
        ];
        Aggregator::new(AggregationPolicy::default()).aggregate(
            1,
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            metrics,
            &defs,
            0,
        )
    }

    #[test]
    fn test_all_green_scores_100() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Green, 1.0),
            metric(2, MetricStatus::Green, 0.5),
            metric(3, MetricStatus::Green, 2.0),
        ]);
        assert_eq!(snapshot.health_score, 100.0);
        assert_eq!(snapshot.overall_status, MetricStatus::Green);
        assert!(!snapshot.action_required);
        assert_eq!(snapshot.green_kpi_count, 3);
    }

    #[test]
    fn test_all_red_scores_0() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Red, -30.0),
            metric(2, MetricStatus::Red, -25.0),
        ]);
        assert_eq!(snapshot.health_score, 0.0);
        assert_eq!(snapshot.overall_status, MetricStatus::Red);
        assert!(snapshot.action_required);
    }

    #[test]
    fn test_score_in_bounds() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Green, 1.0),
            metric(2, MetricStatus::Yellow, -5.0),
            metric(3, MetricStatus::Red, -20.0),
        ]);
        assert!(snapshot.health_score >= 0.0 && snapshot.health_score <= 100.0);
        // (100 + 60 + 0) / 3 = 53.33
        assert_eq!(snapshot.health_score, 53.33);
    }

    #[test]
    fn test_single_yellow_is_yellow() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Green, 1.0),
            metric(2, MetricStatus::Yellow, -5.0),
        ]);
        assert_eq!(snapshot.overall_status, MetricStatus::Yellow);
        assert!(snapshot.action_required);
        assert!(snapshot.summary.contains("area of concern"));
    }

    #[test]
    fn test_two_yellows_escalate_to_red() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Yellow, -5.0),
            metric(2, MetricStatus::Yellow, -6.0),
            metric(3, MetricStatus::Green, 1.0),
        ]);
        assert_eq!(snapshot.overall_status, MetricStatus::Red);
        assert!(snapshot.summary.contains("2 KPIs below target"));
    }

    #[test]
    fn test_yellow_pairing_rule_configurable() {
        let policy = AggregationPolicy {
            yellow_pair_is_red: false,
            ..Default::default()
        };
        let snapshot = Aggregator::new(policy).aggregate(
            1,
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            &[
                metric(1, MetricStatus::Yellow, -5.0),
                metric(2, MetricStatus::Yellow, -6.0),
            ],
            &[],
            0,
        );
        assert_eq!(snapshot.overall_status, MetricStatus::Yellow);
    }

    #[test]
    fn test_unknown_excluded_from_denominator() {
        let snapshot = aggregate(&[
            metric(1, MetricStatus::Green, 1.0),
            metric(2, MetricStatus::Unknown, 0.0),
        ]);
        // Score computed over the single green metric only.
        assert_eq!(snapshot.health_score, 100.0);
        assert_eq!(snapshot.unknown_kpi_count, 1);
        // But the gap is visible and demands action.
        assert!(snapshot.action_required);
        assert!(snapshot.summary.contains("could not be classified"));
        assert!(snapshot.summary.contains("Traffic"));
    }

    #[test]
    fn test_no_metrics_is_green_100() {
        let snapshot = aggregate(&[]);
        assert_eq!(snapshot.health_score, 100.0);
        assert_eq!(snapshot.overall_status, MetricStatus::Green);
    }

    #[test]
    fn test_idempotent_on_same_inputs() {
        let metrics = vec![
            metric(1, MetricStatus::Green, 1.0),
            metric(2, MetricStatus::Yellow, -5.0),
            metric(3, MetricStatus::Red, -22.5),
        ];
        let a = aggregate(&metrics);
        let b = aggregate(&metrics);
        assert_eq!(a, b);
    }
}
