use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{db::TenantHandle, error::TenantError, AppState};

pub const TENANT_HEADER: &str = "x-tenant-id";

/// The caller's tenant database, resolved from the `X-Tenant-Id` header.
///
/// Extraction fails unless the tenant is active and fully provisioned, so a
/// handler holding a `TenantDb` can query it directly.
pub struct TenantDb(pub TenantHandle<PgPool>);

impl TenantDb {
    pub fn pool(&self) -> &PgPool {
        self.0.pool()
    }
}

impl FromRequestParts<AppState> for TenantDb {
    type Rejection = TenantError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = tenant_id(parts)?;
        let handle = state.resolver.resolve(id).await?;
        Ok(TenantDb(handle))
    }
}

fn tenant_id(parts: &Parts) -> Result<Uuid, TenantError> {
    let raw = parts
        .headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TenantError::InvalidInput("Missing X-Tenant-Id header".into()))?;

    Uuid::parse_str(raw).map_err(|_| TenantError::InvalidInput("Invalid X-Tenant-Id header".into()))
}
