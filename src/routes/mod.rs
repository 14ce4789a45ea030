pub mod health;
pub mod metrics;
pub mod node_types;
pub mod tenants;
pub mod users;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        // Admin: tenant lifecycle
        .route("/admin/tenants", get(tenants::list_tenants).post(tenants::create_tenant))
        .route(
            "/admin/tenants/{id}",
            get(tenants::get_tenant)
                .put(tenants::update_tenant)
                .delete(tenants::delete_tenant),
        )
        .route("/admin/tenants/{id}/provision", post(tenants::provision_tenant))
        .route("/admin/tenants/{id}/purge", delete(tenants::purge_tenant))
        .route(
            "/admin/tenants/{id}/users",
            get(users::list_tenant_users).post(users::add_tenant_user),
        )
        .route(
            "/admin/tenants/{id}/users/{user_id}",
            delete(users::remove_tenant_user),
        )
        // Admin: users
        .route("/admin/users", get(users::list_users).post(users::create_user))
        .route(
            "/admin/users/{id}",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        // Tenant-scoped entities
        .route("/node-types", get(node_types::list_node_types).post(node_types::create_node_type))
        .route(
            "/node-types/{id}",
            get(node_types::get_node_type).delete(node_types::delete_node_type),
        )
        .with_state(state)
}
