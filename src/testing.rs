//! Shared test fixtures: temp-file SQLite pools, seeded fleet/KPI rows, and
//! a scripted voice provider.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::config::{KpiSeedConfig, OrganizationConfig, StoreSeedConfig, ThresholdSeedConfig};
use crate::db;
use crate::fleet::{FleetStore, Organization, Store};
use crate::kpi::{ComparisonBasis, KpiDefinition, KpiStore};
use crate::outreach::{CallHandle, CallRequest, CallStatus, VoiceProvider};

/// A fresh migrated pool on a temp file. Keep the file handle alive for the
/// duration of the test.
pub async fn setup_pool() -> (SqlitePool, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let pool = db::open_pool(db_file.path().to_str().unwrap())
        .await
        .unwrap();
    (pool, db_file)
}

/// Seed one organization and one fully-staffed store.
pub async fn seed_fleet(pool: &SqlitePool) -> (Organization, Store) {
    let fleet = FleetStore::new(pool.clone());

    let org_config = OrganizationConfig {
        name: "Test Retail".to_string(),
        ops_manager_name: Some("Pat Ops".to_string()),
        ops_manager_phone: Some("+15550100".to_string()),
        ops_manager_email: Some("ops@example.com".to_string()),
        settings: Default::default(),
    };
    let org = fleet.seed_organization(&org_config).await.unwrap();

    fleet
        .seed_stores(
            org.id,
            &[StoreSeedConfig {
                store_code: "S001".to_string(),
                name: "Downtown".to_string(),
                timezone: "America/New_York".to_string(),
                region_name: Some("Northeast".to_string()),
                region_manager_name: Some("Robin Region".to_string()),
                region_manager_phone: Some("+15550199".to_string()),
                district_name: Some("Metro".to_string()),
                district_manager_name: Some("Dana District".to_string()),
                district_manager_phone: Some("+15550188".to_string()),
                manager_name: Some("Jamie Store".to_string()),
                manager_phone: Some("+15550101".to_string()),
                manager_email: Some("jamie@example.com".to_string()),
            }],
        )
        .await
        .unwrap();

    let store = fleet.get_store_by_code("S001").await.unwrap().unwrap();
    (org, store)
}

/// Seed one KPI definition and return it.
pub async fn seed_kpi(
    pool: &SqlitePool,
    organization_id: i64,
    code: &str,
    name: &str,
    category: &str,
) -> KpiDefinition {
    let kpis = KpiStore::new(pool.clone());
    kpis.seed_definitions(
        organization_id,
        &[KpiSeedConfig {
            code: code.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            unit: "count".to_string(),
            calculation_method: None,
        }],
    )
    .await
    .unwrap();

    kpis.get_definition_by_code(organization_id, code)
        .await
        .unwrap()
        .unwrap()
}

/// Seed an org-wide default threshold for a KPI.
pub async fn seed_threshold(
    pool: &SqlitePool,
    kpi_definition_id: i64,
    organization_id: i64,
    green_min: f64,
    yellow_min: f64,
    red_threshold: f64,
) {
    let kpis = KpiStore::new(pool.clone());
    kpis.upsert_threshold(
        kpi_definition_id,
        organization_id,
        None,
        green_min,
        yellow_min,
        red_threshold,
        ComparisonBasis::Rolling4w,
        1,
    )
    .await
    .unwrap();
}

/// Threshold seed config shorthand for config-driven tests.
pub fn threshold_seed(kpi_code: &str, green: f64, yellow: f64, red: f64) -> ThresholdSeedConfig {
    ThresholdSeedConfig {
        kpi_code: kpi_code.to_string(),
        store_code: None,
        green_min: green,
        yellow_min: yellow,
        red_threshold: red,
        comparison_basis: "rolling_4w".to_string(),
        priority: 1,
    }
}

/// Voice provider that fails its first `fail_first` calls, then accepts.
pub struct MockVoiceProvider {
    fail_first: usize,
    calls: AtomicUsize,
}

impl MockVoiceProvider {
    pub fn new(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceProvider for MockVoiceProvider {
    async fn initiate_call(&self, _request: &CallRequest) -> anyhow::Result<CallHandle> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            anyhow::bail!("provider unavailable");
        }
        Ok(CallHandle {
            external_call_id: format!("conv_{}", n),
            initial_status: CallStatus::InProgress,
        })
    }
}
