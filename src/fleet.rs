//! Fleet entities: the organization and its stores.
//!
//! Stores are onboarded by an external collaborator; the engine reads them
//! (identity, hierarchy pointers, manager contacts) and never mutates them
//! outside of config seeding.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{OrganizationConfig, StoreSeedConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Active,
    Inactive,
    Closed,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Active => "active",
            StoreStatus::Inactive => "inactive",
            StoreStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "inactive" => StoreStatus::Inactive,
            "closed" => StoreStatus::Closed,
            _ => StoreStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub ops_manager_name: Option<String>,
    pub ops_manager_phone: Option<String>,
    pub ops_manager_email: Option<String>,
    pub settings: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Store {
    pub id: i64,
    pub organization_id: i64,
    pub store_code: String,
    pub name: String,
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
    pub status: StoreStatus,
}

/// Database operations for organizations and stores.
pub struct FleetStore {
    pool: SqlitePool,
}

impl FleetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the organization by name and return it.
    pub async fn seed_organization(
        &self,
        config: &OrganizationConfig,
    ) -> anyhow::Result<Organization> {
        let now = Utc::now().to_rfc3339();
        let settings_json = serde_json::to_string(&config.settings)?;

        sqlx::query(
            "INSERT INTO organizations (name, ops_manager_name, ops_manager_phone, ops_manager_email, settings, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
               ops_manager_name = excluded.ops_manager_name,
               ops_manager_phone = excluded.ops_manager_phone,
               ops_manager_email = excluded.ops_manager_email,
               settings = excluded.settings,
               updated_at = excluded.updated_at",
        )
        .bind(&config.name)
        .bind(&config.ops_manager_name)
        .bind(&config.ops_manager_phone)
        .bind(&config.ops_manager_email)
        .bind(&settings_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let org = self
            .get_organization_by_name(&config.name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Organization not found after seed: {}", config.name))?;

        info!(org = %org.name, id = org.id, "Seeded organization");
        Ok(org)
    }

    pub async fn get_organization_by_name(&self, name: &str) -> anyhow::Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_organization(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_organization(&self, id: i64) -> anyhow::Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_organization(&row)?)),
            None => Ok(None),
        }
    }

    /// Seed stores from config (upsert by store code).
    ///
    /// Config seeding never deletes stores: a store missing from config may
    /// still have live history, so it is marked inactive instead.
    pub async fn seed_stores(
        &self,
        organization_id: i64,
        stores: &[StoreSeedConfig],
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        for seed in stores {
            sqlx::query(
                "INSERT INTO stores (
                    organization_id, store_code, name, timezone,
                    region_name, region_manager_name, region_manager_phone,
                    district_name, district_manager_name, district_manager_phone,
                    manager_name, manager_phone, manager_email,
                    status, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
                ON CONFLICT(store_code) DO UPDATE SET
                    name = excluded.name,
                    timezone = excluded.timezone,
                    region_name = excluded.region_name,
                    region_manager_name = excluded.region_manager_name,
                    region_manager_phone = excluded.region_manager_phone,
                    district_name = excluded.district_name,
                    district_manager_name = excluded.district_manager_name,
                    district_manager_phone = excluded.district_manager_phone,
                    manager_name = excluded.manager_name,
                    manager_phone = excluded.manager_phone,
                    manager_email = excluded.manager_email,
                    updated_at = excluded.updated_at",
            )
            .bind(organization_id)
            .bind(&seed.store_code)
            .bind(&seed.name)
            .bind(&seed.timezone)
            .bind(&seed.region_name)
            .bind(&seed.region_manager_name)
            .bind(&seed.region_manager_phone)
            .bind(&seed.district_name)
            .bind(&seed.district_manager_name)
            .bind(&seed.district_manager_phone)
            .bind(&seed.manager_name)
            .bind(&seed.manager_phone)
            .bind(&seed.manager_email)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            info!(store = %seed.store_code, "Seeded store");
        }

        if !stores.is_empty() {
            let codes: Vec<&str> = stores.iter().map(|s| s.store_code.as_str()).collect();
            let placeholders: Vec<String> = codes.iter().map(|_| "?".to_string()).collect();
            let query_str = format!(
                "UPDATE stores SET status = 'inactive', updated_at = ?
                 WHERE organization_id = ? AND status = 'active' AND store_code NOT IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&query_str).bind(&now).bind(organization_id);
            for code in &codes {
                query = query.bind(code);
            }
            let result = query.execute(&self.pool).await?;
            if result.rows_affected() > 0 {
                warn!(
                    count = result.rows_affected(),
                    "Deactivated stores no longer present in config"
                );
            }
        }

        Ok(())
    }

    pub async fn get_store(&self, id: i64) -> anyhow::Result<Option<Store>> {
        let row = sqlx::query("SELECT * FROM stores WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_store(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_store_by_code(&self, code: &str) -> anyhow::Result<Option<Store>> {
        let row = sqlx::query("SELECT * FROM stores WHERE store_code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_store(&row)?)),
            None => Ok(None),
        }
    }

    /// List stores eligible for evaluation.
    pub async fn list_active_stores(&self) -> anyhow::Result<Vec<Store>> {
        let rows = sqlx::query("SELECT * FROM stores WHERE status = 'active' ORDER BY store_code")
            .fetch_all(&self.pool)
            .await?;

        let mut stores = Vec::with_capacity(rows.len());
        for row in rows {
            stores.push(row_to_store(&row)?);
        }
        Ok(stores)
    }
}

fn row_to_organization(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Organization> {
    let settings_json: String = row.get("settings");
    Ok(Organization {
        id: row.get("id"),
        name: row.get("name"),
        ops_manager_name: row.get("ops_manager_name"),
        ops_manager_phone: row.get("ops_manager_phone"),
        ops_manager_email: row.get("ops_manager_email"),
        settings: serde_json::from_str(&settings_json).unwrap_or_default(),
    })
}

fn row_to_store(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Store> {
    let status_str: String = row.get("status");
    Ok(Store {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        store_code: row.get("store_code"),
        name: row.get("name"),
        timezone: row.get("timezone"),
        region_name: row.get("region_name"),
        region_manager_name: row.get("region_manager_name"),
        region_manager_phone: row.get("region_manager_phone"),
        district_name: row.get("district_name"),
        district_manager_name: row.get("district_manager_name"),
        district_manager_phone: row.get("district_manager_phone"),
        manager_name: row.get("manager_name"),
        manager_phone: row.get("manager_phone"),
        manager_email: row.get("manager_email"),
        status: StoreStatus::parse(&status_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_status_conversion() {
        assert_eq!(StoreStatus::Active.as_str(), "active");
        assert_eq!(StoreStatus::parse("active"), StoreStatus::Active);
        assert_eq!(StoreStatus::parse("CLOSED"), StoreStatus::Closed);
        assert_eq!(StoreStatus::parse("inactive"), StoreStatus::Inactive);
        // Unrecognized values default to active rather than dropping the store.
        assert_eq!(StoreStatus::parse("whatever"), StoreStatus::Active);
    }
}
