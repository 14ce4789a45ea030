use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::TenantError,
    middleware::admin::AdminAuth,
    models::user::{
        AddTenantUserRequest, CreateUserRequest, ListUsersQuery, TenantUser, TenantUserPage,
        UpdateUserRequest, User, UserPage,
    },
    services::users::UserService,
    AppState,
};

// ─── Users ────────────────────────────────────────────────────────────────────

pub async fn list_users(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<UserPage>, TenantError> {
    UserService::list(&state.control, &query).await.map(Json)
}

pub async fn create_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), TenantError> {
    let user = UserService::create(&state.control, &body).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, TenantError> {
    UserService::get(&state.control, id).await.map(Json)
}

pub async fn update_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<User>, TenantError> {
    UserService::update(&state.control, id, &body).await.map(Json)
}

pub async fn delete_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, TenantError> {
    UserService::delete(&state.control, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Tenant membership ────────────────────────────────────────────────────────

pub async fn list_tenant_users(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<TenantUserPage>, TenantError> {
    UserService::list_tenant_users(&state.control, tenant_id, &query)
        .await
        .map(Json)
}

pub async fn add_tenant_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<AddTenantUserRequest>,
) -> Result<Json<TenantUser>, TenantError> {
    UserService::add_to_tenant(&state.control, tenant_id, &body)
        .await
        .map(Json)
}

pub async fn remove_tenant_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path((tenant_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, TenantError> {
    UserService::remove_from_tenant(&state.control, tenant_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
