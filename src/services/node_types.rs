use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    db::is_unique_violation,
    error::TenantError,
    models::node_type::{CreateNodeTypeRequest, NodeType},
};

/// Node type access against a resolved tenant database. Every tenant has its
/// own `node_types` table, so no tenant column appears in these queries.
pub struct NodeTypeService;

impl NodeTypeService {
    pub async fn list(pool: &PgPool) -> Result<Vec<NodeType>, TenantError> {
        let node_types = sqlx::query_as::<_, NodeType>("SELECT * FROM node_types ORDER BY name")
            .fetch_all(pool)
            .await?;
        Ok(node_types)
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> Result<NodeType, TenantError> {
        sqlx::query_as::<_, NodeType>("SELECT * FROM node_types WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| TenantError::NotFound(format!("node type not found: {id}")))
    }

    pub async fn create(pool: &PgPool, req: &CreateNodeTypeRequest) -> Result<NodeType, TenantError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(TenantError::InvalidInput("name must not be empty".into()));
        }

        sqlx::query_as::<_, NodeType>(
            "INSERT INTO node_types (name, description, schema)
             VALUES ($1, $2, $3)
             RETURNING *",
        )
        .bind(name)
        .bind(req.description.as_deref().unwrap_or_default())
        .bind(&req.schema)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TenantError::Conflict(format!("node type '{name}' already exists"))
            } else {
                e.into()
            }
        })
    }

    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), TenantError> {
        let deleted = sqlx::query("DELETE FROM node_types WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(TenantError::NotFound(format!("node type not found: {id}")));
        }
        Ok(())
    }
}
