//! Metric ingestion: one immutable fact per (store, KPI, date).
//!
//! The ingestion collaborator owns computing the comparison baseline
//! (rolling average, prior year, budget); the engine never invents one. It
//! classifies at ingest time so the stored row carries its variance and
//! status from the moment it exists.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use crate::error::EngineError;
use crate::fleet::FleetStore;
use crate::kpi::{classify, ComparisonBasis, KpiMetric, KpiStore, MetricStatus};

/// One inbound metric record.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricSample {
    pub store_code: String,
    pub kpi_code: String,
    pub metric_date: NaiveDate,
    pub value: f64,
    /// Baseline computed by the ingestion side per the comparison basis.
    pub comparison_value: Option<f64>,
    /// Which basis the collaborator used; defaults to the threshold's.
    pub comparison_basis: Option<String>,
}

pub struct MetricIngestor {
    fleet: Arc<FleetStore>,
    kpis: Arc<KpiStore>,
}

impl MetricIngestor {
    pub fn new(fleet: Arc<FleetStore>, kpis: Arc<KpiStore>) -> Self {
        Self { fleet, kpis }
    }

    /// Classify and persist one sample. Corrections for an existing
    /// (store, KPI, date) are simply ingested again: the new row wins.
    pub async fn ingest(&self, sample: &MetricSample) -> anyhow::Result<KpiMetric> {
        let store = self
            .fleet
            .get_store_by_code(&sample.store_code)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!("unknown store code: {}", sample.store_code))
            })?;

        let definition = self
            .kpis
            .get_definition_by_code(store.organization_id, &sample.kpi_code)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!("unknown KPI code: {}", sample.kpi_code))
            })?;

        let threshold = self
            .kpis
            .threshold_for(definition.id, store.organization_id, store.id)
            .await?;

        let classification = classify(sample.value, sample.comparison_value, threshold.as_ref());

        let basis = sample
            .comparison_basis
            .as_deref()
            .map(ComparisonBasis::parse)
            .or(threshold.as_ref().map(|t| t.comparison_basis));

        let metric_id = self
            .kpis
            .insert_metric(
                store.id,
                definition.id,
                sample.metric_date,
                sample.value,
                sample.comparison_value,
                basis,
                classification.variance_pct,
                classification.status,
            )
            .await?;

        info!(
            store = %store.store_code,
            kpi = %definition.kpi_code,
            date = %sample.metric_date,
            status = classification.status.as_str(),
            variance = ?classification.variance_pct,
            "Metric ingested"
        );

        let metric = self
            .kpis
            .latest_metrics_for_day(store.id, sample.metric_date)
            .await?
            .into_iter()
            .find(|m| m.id == metric_id)
            .ok_or_else(|| anyhow::anyhow!("metric {} missing after insert", metric_id))?;

        Ok(metric)
    }
}

// Re-exported so the ingest HTTP handler can surface classification
// problems distinctly from storage failures.
pub fn is_unclassified(metric: &KpiMetric) -> bool {
    metric.status == MetricStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn setup() -> (MetricIngestor, sqlx::SqlitePool, tempfile::NamedTempFile) {
        let (pool, db_file) = testing::setup_pool().await;
        let ingestor = MetricIngestor::new(
            Arc::new(FleetStore::new(pool.clone())),
            Arc::new(KpiStore::new(pool.clone())),
        );
        (ingestor, pool, db_file)
    }

    fn sample(value: f64, baseline: f64) -> MetricSample {
        MetricSample {
            store_code: "S001".to_string(),
            kpi_code: "sales".to_string(),
            metric_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            value,
            comparison_value: Some(baseline),
            comparison_basis: Some("rolling_4w".to_string()),
        }
    }

    #[tokio::test]
    async fn test_ingest_classifies_and_persists() {
        let (ingestor, pool, _db) = setup().await;
        let (org, _store) = testing::seed_fleet(&pool).await;
        let kpi = testing::seed_kpi(&pool, org.id, "sales", "Net Sales", "sales").await;
        testing::seed_threshold(&pool, kpi.id, org.id, -2.0, -8.0, -15.0).await;

        let metric = ingestor.ingest(&sample(70.0, 100.0)).await.unwrap();
        assert_eq!(metric.status, MetricStatus::Red);
        assert!((metric.variance_pct.unwrap() + 30.0).abs() < 1e-9);
        assert_eq!(metric.comparison_basis, Some(ComparisonBasis::Rolling4w));
    }

    #[tokio::test]
    async fn test_ingest_without_threshold_is_unknown() {
        let (ingestor, pool, _db) = setup().await;
        let (org, _store) = testing::seed_fleet(&pool).await;
        testing::seed_kpi(&pool, org.id, "sales", "Net Sales", "sales").await;

        let metric = ingestor.ingest(&sample(70.0, 100.0)).await.unwrap();
        assert_eq!(metric.status, MetricStatus::Unknown);
        assert_eq!(metric.variance_pct, None);
        assert!(is_unclassified(&metric));
    }

    #[tokio::test]
    async fn test_ingest_unknown_store_fails() {
        let (ingestor, _pool, _db) = setup().await;
        let err = ingestor.ingest(&sample(70.0, 100.0)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_correction_wins_at_read_time() {
        let (ingestor, pool, _db) = setup().await;
        let (org, store) = testing::seed_fleet(&pool).await;
        let kpi = testing::seed_kpi(&pool, org.id, "sales", "Net Sales", "sales").await;
        testing::seed_threshold(&pool, kpi.id, org.id, -2.0, -8.0, -15.0).await;

        ingestor.ingest(&sample(70.0, 100.0)).await.unwrap();
        ingestor.ingest(&sample(99.0, 100.0)).await.unwrap();

        let kpis = KpiStore::new(pool);
        let latest = kpis
            .latest_metrics_for_day(store.id, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap())
            .await
            .unwrap();
        // One winning row per KPI, and it is the correction.
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].status, MetricStatus::Green);
        assert_eq!(latest[0].value, 99.0);
    }
}
