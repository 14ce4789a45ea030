use std::{ops::Deref, sync::Arc};

use tracing::{debug, info};
use uuid::Uuid;

use super::{
    pool_cache::{PoolCache, PoolHandle},
    provisioner::Provisioner,
    registry::TenantRegistry,
    server::DatabaseServer,
};
use crate::{
    error::TenantError,
    models::tenant::{MappingStatus, Tenant, TenantDatabase, TenantStatus},
    services::metrics::RESOLVE_COUNTER,
};

/// A ready-to-query tenant database. Holds a pool lease for as long as it lives.
#[derive(Debug)]
pub struct TenantHandle<P> {
    pub tenant: Tenant,
    pub database: String,
    pool: PoolHandle<P>,
}

impl<P> TenantHandle<P> {
    pub fn pool(&self) -> &P {
        self.pool.pool()
    }
}

impl<P> Deref for TenantHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.pool.pool()
    }
}

pub struct TenantResolver<S: DatabaseServer, R> {
    registry: Arc<R>,
    provisioner: Provisioner<S, R>,
    pools: Arc<PoolCache<S>>,
}

impl<S, R> TenantResolver<S, R>
where
    S: DatabaseServer,
    R: TenantRegistry,
{
    pub fn new(registry: Arc<R>, provisioner: Provisioner<S, R>, pools: Arc<PoolCache<S>>) -> Self {
        Self {
            registry,
            provisioner,
            pools,
        }
    }

    pub fn provisioner(&self) -> &Provisioner<S, R> {
        &self.provisioner
    }

    /// The only way entity code reaches a tenant database. Succeeds only for an
    /// active tenant whose mapping is `active` and carries every tenant
    /// migration; a tenant with no mapping yet is provisioned on the spot, and
    /// one left behind by an older release is upgraded first.
    pub async fn resolve(&self, id: Uuid) -> Result<TenantHandle<S::Pool>, TenantError> {
        let result = self.try_resolve(id).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        RESOLVE_COUNTER.with_label_values(&[outcome]).inc();
        result
    }

    async fn try_resolve(&self, id: Uuid) -> Result<TenantHandle<S::Pool>, TenantError> {
        let tenant = self.registry.get_tenant(id).await?;
        usable(&tenant)?;

        let mut provisioned = false;
        let mapping = match self.registry.get_mapping(id).await {
            Ok(mapping) => mapping,
            Err(TenantError::NotFound(_)) => {
                info!(tenant = %tenant.slug, "no database mapping, provisioning on first access");
                provisioned = true;
                self.provisioner.provision(&tenant).await?
            }
            Err(e) => return Err(e),
        };

        let mapping = match mapping.status {
            MappingStatus::Active if self.provisioner.is_current(&mapping) => mapping,
            MappingStatus::Active => {
                info!(
                    tenant = %tenant.slug,
                    recorded = ?mapping.schema_version,
                    latest = ?self.provisioner.schema_version(),
                    "tenant schema is behind, upgrading before use"
                );
                provisioned = true;
                self.provisioner.provision(&tenant).await?
            }
            MappingStatus::Provisioning => {
                provisioned = true;
                self.wait_for_provisioning(&tenant).await?
            }
            MappingStatus::Failed => return Err(failed(&mapping)),
        };

        let (pool, built) = self.pools.get_or_build(&mapping.database_name).await?;
        if built || provisioned {
            // The tenant may have been deactivated while the pool was being
            // built, after its release already ran.
            let current = self.registry.get_tenant(id).await.and_then(|t| usable(&t));
            if let Err(e) = current {
                drop(pool);
                info!(
                    tenant = %tenant.slug,
                    database = %mapping.database_name,
                    "tenant left active state during lookup, releasing pool"
                );
                self.pools.remove(&mapping.database_name).await;
                return Err(e);
            }
        }

        debug!(tenant = %tenant.slug, database = %mapping.database_name, "resolved tenant database");
        Ok(TenantHandle {
            tenant,
            database: mapping.database_name,
            pool,
        })
    }

    /// Joins this process's attempt if there is one; otherwise the claim
    /// belongs to someone else and the caller is told to come back.
    async fn wait_for_provisioning(&self, tenant: &Tenant) -> Result<TenantDatabase, TenantError> {
        if let Some(attempt) = self.provisioner.in_flight(tenant.id) {
            debug!(tenant = %tenant.slug, "waiting for in-flight provisioning");
            return attempt.await;
        }

        // The local attempt may have finished between the two reads.
        let mapping = self.registry.get_mapping(tenant.id).await?;
        match mapping.status {
            MappingStatus::Active => Ok(mapping),
            MappingStatus::Provisioning => Err(TenantError::provisioning_in_progress(tenant.id)),
            MappingStatus::Failed => Err(failed(&mapping)),
        }
    }
}

fn usable(tenant: &Tenant) -> Result<(), TenantError> {
    match tenant.status {
        TenantStatus::Active => Ok(()),
        TenantStatus::Inactive => Err(TenantError::Inactive(tenant.id)),
        TenantStatus::Deleted => Err(TenantError::tenant_not_found(tenant.id)),
    }
}

fn failed(mapping: &TenantDatabase) -> TenantError {
    TenantError::ProvisioningFailed {
        tenant: mapping.tenant_id,
        reason: mapping
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
    }
}
