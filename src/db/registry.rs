use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{is_foreign_key_violation, is_unique_violation};
use crate::{
    error::TenantError,
    models::tenant::{MappingStatus, ProvisionClaim, Tenant, TenantDatabase, UpdateTenantRequest},
};

/// Source of truth for tenants and their database mappings, backed by the
/// control database.
#[async_trait]
pub trait TenantRegistry: Send + Sync + 'static {
    /// Fails with `Conflict` if the slug is taken; the uniqueness constraint decides races.
    async fn create_tenant(&self, slug: &str, name: &str) -> Result<Tenant, TenantError>;

    async fn get_tenant(&self, id: Uuid) -> Result<Tenant, TenantError>;

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Tenant, TenantError>;

    /// Newest first. Returns the page and the total number of tenants.
    async fn list_tenants(&self, limit: i64, offset: i64) -> Result<(Vec<Tenant>, i64), TenantError>;

    async fn update_tenant(&self, id: Uuid, changes: &UpdateTenantRequest) -> Result<Tenant, TenantError>;

    /// Removes the tenant row; its mapping goes with it.
    async fn delete_tenant(&self, id: Uuid) -> Result<(), TenantError>;

    async fn get_mapping(&self, id: Uuid) -> Result<TenantDatabase, TenantError>;

    async fn list_mappings(&self) -> Result<Vec<TenantDatabase>, TenantError>;

    /// Idempotent upsert of the mapping row. A `None` schema version keeps
    /// the stored one.
    async fn record_mapping(
        &self,
        id: Uuid,
        database_name: &str,
        status: MappingStatus,
        last_error: Option<&str>,
        schema_version: Option<i64>,
    ) -> Result<TenantDatabase, TenantError>;

    /// Atomically moves the mapping to `provisioning` unless another attempt
    /// holds a claim younger than `stale_after`.
    async fn claim_provisioning(
        &self,
        id: Uuid,
        database_name: &str,
        stale_after: Duration,
    ) -> Result<ProvisionClaim, TenantError>;
}

#[derive(Debug, Clone)]
pub struct PgTenantRegistry {
    pool: PgPool,
}

impl PgTenantRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn mapping_write_error(id: Uuid, database_name: &str, err: sqlx::Error) -> TenantError {
    if is_unique_violation(&err) {
        TenantError::Conflict(format!(
            "database {database_name} is already mapped to another tenant"
        ))
    } else if is_foreign_key_violation(&err) {
        TenantError::tenant_not_found(id)
    } else {
        err.into()
    }
}

#[async_trait]
impl TenantRegistry for PgTenantRegistry {
    async fn create_tenant(&self, slug: &str, name: &str) -> Result<Tenant, TenantError> {
        sqlx::query_as::<_, Tenant>(
            "INSERT INTO tenants (slug, name)
             VALUES ($1, $2)
             RETURNING *",
        )
        .bind(slug)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TenantError::Conflict(format!("tenant with slug '{slug}' already exists"))
            } else {
                e.into()
            }
        })
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Tenant, TenantError> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantError::tenant_not_found(id))
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Tenant, TenantError> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantError::NotFound(format!("tenant not found: {slug}")))
    }

    async fn list_tenants(&self, limit: i64, offset: i64) -> Result<(Vec<Tenant>, i64), TenantError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants")
            .fetch_one(&self.pool)
            .await?;

        let tenants = sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants
             ORDER BY created_at DESC, slug
             LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((tenants, total))
    }

    async fn update_tenant(&self, id: Uuid, changes: &UpdateTenantRequest) -> Result<Tenant, TenantError> {
        sqlx::query_as::<_, Tenant>(
            "UPDATE tenants SET
               name       = COALESCE($2, name),
               status     = COALESCE($3, status),
               updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&changes.name)
        .bind(changes.status)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenantError::tenant_not_found(id))
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<(), TenantError> {
        let deleted = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(TenantError::tenant_not_found(id));
        }
        Ok(())
    }

    async fn get_mapping(&self, id: Uuid) -> Result<TenantDatabase, TenantError> {
        sqlx::query_as::<_, TenantDatabase>("SELECT * FROM tenant_databases WHERE tenant_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenantError::NotFound(format!("no database mapping for tenant {id}")))
    }

    async fn list_mappings(&self) -> Result<Vec<TenantDatabase>, TenantError> {
        let mappings = sqlx::query_as::<_, TenantDatabase>(
            "SELECT * FROM tenant_databases ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(mappings)
    }

    async fn record_mapping(
        &self,
        id: Uuid,
        database_name: &str,
        status: MappingStatus,
        last_error: Option<&str>,
        schema_version: Option<i64>,
    ) -> Result<TenantDatabase, TenantError> {
        sqlx::query_as::<_, TenantDatabase>(
            "INSERT INTO tenant_databases (tenant_id, database_name, status, last_error, schema_version)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id) DO UPDATE SET
               database_name  = EXCLUDED.database_name,
               status         = EXCLUDED.status,
               last_error     = EXCLUDED.last_error,
               schema_version = COALESCE(EXCLUDED.schema_version, tenant_databases.schema_version),
               updated_at     = NOW()
             RETURNING *",
        )
        .bind(id)
        .bind(database_name)
        .bind(status)
        .bind(last_error)
        .bind(schema_version)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| mapping_write_error(id, database_name, e))
    }

    async fn claim_provisioning(
        &self,
        id: Uuid,
        database_name: &str,
        stale_after: Duration,
    ) -> Result<ProvisionClaim, TenantError> {
        // The WHERE on the conflict branch makes check-and-publish one statement:
        // a fresh `provisioning` row leaves the upsert with no returned row.
        let claimed = sqlx::query_as::<_, TenantDatabase>(
            "INSERT INTO tenant_databases (tenant_id, database_name, status)
             VALUES ($1, $2, 'provisioning')
             ON CONFLICT (tenant_id) DO UPDATE SET
               database_name = EXCLUDED.database_name,
               status        = 'provisioning',
               last_error    = NULL,
               updated_at    = NOW()
             WHERE tenant_databases.status <> 'provisioning'
                OR tenant_databases.updated_at < NOW() - make_interval(secs => $3)
             RETURNING *",
        )
        .bind(id)
        .bind(database_name)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| mapping_write_error(id, database_name, e))?;

        match claimed {
            Some(mapping) => Ok(ProvisionClaim::Claimed(mapping)),
            None => Ok(ProvisionClaim::InProgress(self.get_mapping(id).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pg;

    async fn registry() -> (test_pg::TestPostgres, PgTenantRegistry) {
        let pg = test_pg::start().await;
        let registry = PgTenantRegistry::new(pg.control.clone());
        (pg, registry)
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn duplicate_slug_is_a_conflict() {
        let (_pg, registry) = registry().await;
        registry.create_tenant("acme", "Acme").await.unwrap();

        let err = registry.create_tenant("acme", "Acme Two").await.unwrap_err();
        assert!(matches!(err, TenantError::Conflict(_)), "got {err:?}");
        let (tenants, total) = registry.list_tenants(10, 0).await.unwrap();
        assert_eq!((tenants.len(), total), (1, 1));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn mapping_writes_for_unknown_tenants_are_not_found() {
        let (_pg, registry) = registry().await;
        let stranger = Uuid::new_v4();

        let err = registry
            .record_mapping(stranger, "tenant_stranger", MappingStatus::Active, None, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::NotFound(_)), "got {err:?}");
        let err = registry
            .claim_provisioning(stranger, "tenant_stranger", Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn claim_is_exclusive_until_released_or_stale() {
        let (pg, registry) = registry().await;
        let tenant = registry.create_tenant("claims", "Claims").await.unwrap();
        let stale_after = Duration::from_secs(300);

        let first = registry
            .claim_provisioning(tenant.id, "tenant_claims", stale_after)
            .await
            .unwrap();
        assert!(matches!(first, ProvisionClaim::Claimed(ref m) if m.status == MappingStatus::Provisioning));
        let second = registry
            .claim_provisioning(tenant.id, "tenant_claims", stale_after)
            .await
            .unwrap();
        assert!(matches!(second, ProvisionClaim::InProgress(_)));

        // Publishing releases the claim; the schema version sticks across a later failure.
        registry
            .record_mapping(tenant.id, "tenant_claims", MappingStatus::Active, None, Some(3))
            .await
            .unwrap();
        let reclaimed = registry
            .claim_provisioning(tenant.id, "tenant_claims", stale_after)
            .await
            .unwrap();
        assert!(matches!(reclaimed, ProvisionClaim::Claimed(_)));
        let failed = registry
            .record_mapping(tenant.id, "tenant_claims", MappingStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        assert_eq!(failed.schema_version, Some(3));
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        registry
            .claim_provisioning(tenant.id, "tenant_claims", stale_after)
            .await
            .unwrap();
        sqlx::query("UPDATE tenant_databases SET updated_at = NOW() - INTERVAL '10 minutes' WHERE tenant_id = $1")
            .bind(tenant.id)
            .execute(&pg.control)
            .await
            .unwrap();
        let taken_over = registry
            .claim_provisioning(tenant.id, "tenant_claims", stale_after)
            .await
            .unwrap();
        match taken_over {
            ProvisionClaim::Claimed(mapping) => assert!(mapping.last_error.is_none()),
            other => panic!("stale claim was not taken over: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires Docker"]
    async fn concurrent_claims_have_one_winner() {
        let (_pg, registry) = registry().await;
        let id = registry.create_tenant("race", "Race").await.unwrap().id;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .claim_provisioning(id, "tenant_race", Duration::from_secs(300))
                        .await
                })
            })
            .collect();

        let mut claimed = 0;
        for task in tasks {
            if let ProvisionClaim::Claimed(_) = task.await.unwrap().unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn update_and_delete_cascade_to_the_mapping() {
        let (_pg, registry) = registry().await;
        let tenant = registry.create_tenant("cascade", "Cascade").await.unwrap();
        registry
            .record_mapping(tenant.id, "tenant_cascade", MappingStatus::Active, None, Some(3))
            .await
            .unwrap();

        let changes = UpdateTenantRequest {
            name: Some("Renamed".into()),
            status: None,
        };
        let updated = registry.update_tenant(tenant.id, &changes).await.unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.status, tenant.status);

        registry.delete_tenant(tenant.id).await.unwrap();
        assert!(matches!(registry.get_mapping(tenant.id).await, Err(TenantError::NotFound(_))));
        assert!(matches!(registry.delete_tenant(tenant.id).await, Err(TenantError::NotFound(_))));
    }
}
