use axum::{extract::Path, http::StatusCode, Json};
use uuid::Uuid;

use crate::{
    error::TenantError,
    middleware::tenant::TenantDb,
    models::node_type::{CreateNodeTypeRequest, NodeType},
    services::node_types::NodeTypeService,
};

pub async fn list_node_types(db: TenantDb) -> Result<Json<Vec<NodeType>>, TenantError> {
    NodeTypeService::list(db.pool()).await.map(Json)
}

pub async fn create_node_type(
    db: TenantDb,
    Json(body): Json<CreateNodeTypeRequest>,
) -> Result<(StatusCode, Json<NodeType>), TenantError> {
    let node_type = NodeTypeService::create(db.pool(), &body).await?;
    Ok((StatusCode::CREATED, Json(node_type)))
}

pub async fn get_node_type(db: TenantDb, Path(id): Path<Uuid>) -> Result<Json<NodeType>, TenantError> {
    NodeTypeService::get(db.pool(), id).await.map(Json)
}

pub async fn delete_node_type(db: TenantDb, Path(id): Path<Uuid>) -> Result<StatusCode, TenantError> {
    NodeTypeService::delete(db.pool(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}
