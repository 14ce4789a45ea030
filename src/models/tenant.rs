use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Deleted,
}

/// Lifecycle of the physical database behind a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "mapping_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Active,
    Provisioning,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The authoritative tenant -> physical database link.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantDatabase {
    pub tenant_id: Uuid,
    pub database_name: String,
    pub status: MappingStatus,
    pub last_error: Option<String>,
    /// Highest tenant migration applied when the mapping last went `active`.
    pub schema_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of trying to take ownership of a tenant's provisioning.
#[derive(Debug, Clone)]
pub enum ProvisionClaim {
    /// The caller now owns provisioning; the mapping is `provisioning`.
    Claimed(TenantDatabase),
    /// Another attempt holds a fresh `provisioning` claim.
    InProgress(TenantDatabase),
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub status: Option<TenantStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListTenantsQuery {
    pub page_size: Option<i64>,
    pub page_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TenantPage {
    pub tenants: Vec<Tenant>,
    pub next_page_token: Option<String>,
    pub total_count: i64,
}

/// A tenant together with the state of its storage.
#[derive(Debug, Serialize)]
pub struct TenantDetails {
    #[serde(flatten)]
    pub tenant: Tenant,
    pub database: Option<TenantDatabase>,
}
