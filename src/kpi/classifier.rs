//! Pure metric classification against thresholds.
//!
//! No I/O here: the ingestion path and tests both call `classify` directly.

use tracing::warn;

use super::{ComparisonBasis, KpiThreshold, MetricStatus};

/// Result of classifying one metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub variance_pct: Option<f64>,
    pub status: MetricStatus,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            variance_pct: None,
            status: MetricStatus::Unknown,
        }
    }
}

/// Classify a raw metric value against its baseline and threshold.
///
/// Variance is `(value - baseline) / baseline * 100`; status is green at or
/// above `green_min`, yellow from `yellow_min` up to `green_min`, red below
/// `yellow_min` (red is the catch-all; `red_threshold` only affects message
/// wording downstream).
///
/// Fails closed: a missing threshold, an inverted green/yellow boundary, or
/// an unusable baseline all yield `Unknown`, never green. Silently treating
/// an unconfigured KPI as healthy is the failure mode this function exists
/// to prevent.
pub fn classify(
    value: f64,
    baseline: Option<f64>,
    threshold: Option<&KpiThreshold>,
) -> Classification {
    let Some(threshold) = threshold else {
        return Classification::unknown();
    };

    if threshold.yellow_min > threshold.green_min {
        warn!(
            kpi_definition_id = threshold.kpi_definition_id,
            yellow_min = threshold.yellow_min,
            green_min = threshold.green_min,
            "Threshold boundaries inverted; metric degraded to unknown"
        );
        return Classification::unknown();
    }

    if !threshold.is_well_ordered() {
        // red_threshold out of place is tolerable for classification, but
        // operators should hear about it.
        warn!(
            kpi_definition_id = threshold.kpi_definition_id,
            red_threshold = threshold.red_threshold,
            yellow_min = threshold.yellow_min,
            "Threshold red boundary does not sit below yellow"
        );
    }

    let variance_pct = match threshold.comparison_basis {
        // Absolute thresholds compare the raw value against the boundaries
        // directly; there is no baseline to divide by.
        ComparisonBasis::Absolute => value,
        _ => match baseline {
            Some(b) if b != 0.0 => (value - b) / b * 100.0,
            _ => {
                warn!(
                    kpi_definition_id = threshold.kpi_definition_id,
                    "Missing or zero baseline under a relative basis; metric degraded to unknown"
                );
                return Classification::unknown();
            }
        },
    };

    let status = if variance_pct >= threshold.green_min {
        MetricStatus::Green
    } else if variance_pct >= threshold.yellow_min {
        MetricStatus::Yellow
    } else {
        MetricStatus::Red
    };

    Classification {
        variance_pct: Some(variance_pct),
        status,
    }
}
