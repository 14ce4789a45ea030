use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::paging::PageRequest;
use crate::{
    db::{tenant::validate_slug, DatabaseServer, PoolCache, Provisioner, TenantRegistry},
    error::TenantError,
    models::tenant::{
        ListTenantsQuery, Tenant, TenantDetails, TenantPage, TenantStatus, UpdateTenantRequest,
    },
};

/// Outcome of upgrading every provisioned tenant at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrateSummary {
    pub upgraded: usize,
    /// Mappings already carrying every tenant migration; left unclaimed.
    pub current: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Tenant lifecycle on top of the registry and provisioner.
pub struct TenantService<S: DatabaseServer, R> {
    registry: Arc<R>,
    provisioner: Provisioner<S, R>,
    pools: Arc<PoolCache<S>>,
}

impl<S, R> TenantService<S, R>
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

    /// Registers the tenant and provisions its database before returning.
    ///
    /// If provisioning fails the error is returned and the tenant row stays,
    /// with a `failed` mapping, so `reprovision` can pick it up.
    pub async fn create(&self, slug: &str, name: &str) -> Result<TenantDetails, TenantError> {
        validate_slug(slug, &self.provisioner.config().database_prefix)?;
        let name = require_name(name)?;

        let tenant = self.registry.create_tenant(slug, name).await?;
        info!(tenant = %tenant.slug, id = %tenant.id, "tenant created");

        let mapping = self.provisioner.provision(&tenant).await?;
        Ok(TenantDetails {
            tenant,
            database: Some(mapping),
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<TenantDetails, TenantError> {
        let tenant = self.registry.get_tenant(id).await?;
        let database = match self.registry.get_mapping(id).await {
            Ok(mapping) => Some(mapping),
            Err(TenantError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(TenantDetails { tenant, database })
    }

    /// Offset pagination; the page token is the offset of the next page.
    pub async fn list(&self, query: &ListTenantsQuery) -> Result<TenantPage, TenantError> {
        let page = PageRequest::parse(query.page_size, query.page_token.as_deref())?;
        let (tenants, total_count) = self.registry.list_tenants(page.size, page.offset).await?;

        Ok(TenantPage {
            next_page_token: page.next_token(tenants.len(), total_count),
            tenants,
            total_count,
        })
    }

    /// Renames or changes lifecycle status. The slug cannot change: it names
    /// the physical database.
    pub async fn update(&self, id: Uuid, changes: &UpdateTenantRequest) -> Result<Tenant, TenantError> {
        let changes = UpdateTenantRequest {
            name: changes
                .name
                .as_deref()
                .map(require_name)
                .transpose()?
                .map(str::to_string),
            status: changes.status,
        };

        let tenant = self.registry.update_tenant(id, &changes).await?;
        if tenant.status != TenantStatus::Active {
            self.release_pool(&tenant).await;
        }
        Ok(tenant)
    }

    /// Soft delete: the tenant stops resolving, its database is kept.
    pub async fn delete(&self, id: Uuid) -> Result<Tenant, TenantError> {
        let changes = UpdateTenantRequest {
            status: Some(TenantStatus::Deleted),
            ..UpdateTenantRequest::default()
        };
        let tenant = self.registry.update_tenant(id, &changes).await?;
        self.release_pool(&tenant).await;
        info!(tenant = %tenant.slug, "tenant soft-deleted");
        Ok(tenant)
    }

    /// Hard delete: drops the physical database and forgets the tenant.
    pub async fn purge(&self, id: Uuid) -> Result<(), TenantError> {
        let tenant = self.registry.get_tenant(id).await?;
        let database = self.database_of(&tenant).await?;

        self.pools.remove(&database).await;
        self.pools.server().drop_database(&database).await?;
        self.registry.delete_tenant(id).await?;

        info!(tenant = %tenant.slug, %database, "tenant purged");
        Ok(())
    }

    /// Explicit retry for a `failed` mapping, also usable to apply new migrations.
    pub async fn reprovision(&self, id: Uuid) -> Result<TenantDetails, TenantError> {
        let tenant = self.registry.get_tenant(id).await?;
        let mapping = self.provisioner.provision(&tenant).await?;
        Ok(TenantDetails {
            tenant,
            database: Some(mapping),
        })
    }

    /// Applies pending tenant migrations to every tenant that already has a
    /// database mapping. Failures are logged and do not stop the sweep.
    ///
    /// Mappings whose recorded schema version is current are not claimed, so
    /// the sweep does not make up-to-date tenants unavailable elsewhere.
    pub async fn migrate_existing(&self) -> Result<MigrateSummary, TenantError> {
        let mappings = self.registry.list_mappings().await?;
        let mut summary = MigrateSummary::default();

        for mapping in mappings {
            let tenant = match self.registry.get_tenant(mapping.tenant_id).await {
                Ok(tenant) if tenant.status != TenantStatus::Deleted => tenant,
                Ok(_) | Err(TenantError::NotFound(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.provisioner.is_current(&mapping) {
                summary.current += 1;
                continue;
            }

            match self.provisioner.provision(&tenant).await {
                Ok(_) => summary.upgraded += 1,
                Err(e) => {
                    warn!(tenant = %tenant.slug, "tenant migration failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            upgraded = summary.upgraded,
            current = summary.current,
            failed = summary.failed,
            skipped = summary.skipped,
            "tenant migrations completed"
        );
        Ok(summary)
    }

    async fn database_of(&self, tenant: &Tenant) -> Result<String, TenantError> {
        match self.registry.get_mapping(tenant.id).await {
            Ok(mapping) => Ok(mapping.database_name),
            Err(TenantError::NotFound(_)) => Ok(self.provisioner.database_name(tenant)),
            Err(e) => Err(e),
        }
    }

    async fn release_pool(&self, tenant: &Tenant) {
        match self.database_of(tenant).await {
            Ok(database) => {
                self.pools.remove(&database).await;
            }
            Err(e) => warn!(tenant = %tenant.slug, "could not look up database to release its pool: {e}"),
        }
    }
}

fn require_name(name: &str) -> Result<&str, TenantError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TenantError::InvalidInput("name must not be empty".into()));
    }
    Ok(name)
}
