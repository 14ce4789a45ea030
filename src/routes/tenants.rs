use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::TenantError,
    middleware::admin::AdminAuth,
    models::tenant::{
        CreateTenantRequest, ListTenantsQuery, Tenant, TenantDetails, TenantPage, UpdateTenantRequest,
    },
    AppState,
};

// ─── Tenant CRUD ──────────────────────────────────────────────────────────────

pub async fn list_tenants(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<ListTenantsQuery>,
) -> Result<Json<TenantPage>, TenantError> {
    state.tenants.list(&query).await.map(Json)
}

pub async fn create_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(body): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<TenantDetails>), TenantError> {
    let details = state.tenants.create(&body.slug, &body.name).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantDetails>, TenantError> {
    state.tenants.get(id).await.map(Json)
}

pub async fn update_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTenantRequest>,
) -> Result<Json<Tenant>, TenantError> {
    state.tenants.update(id, &body).await.map(Json)
}

/// Soft delete. The database is kept until `purge`.
pub async fn delete_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Tenant>, TenantError> {
    state.tenants.delete(id).await.map(Json)
}

// ─── Storage operations ───────────────────────────────────────────────────────

pub async fn provision_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantDetails>, TenantError> {
    state.tenants.reprovision(id).await.map(Json)
}

pub async fn purge_tenant(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, TenantError> {
    state.tenants.purge(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
