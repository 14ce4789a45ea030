//! Creates, migrates and publishes a tenant's physical database.
//!
//! Two layers keep concurrent first access from provisioning twice. Within a
//! process, attempts are single-flight per tenant id: callers join one shared
//! future. Across processes, only the winner of the registry's
//! `claim_provisioning` upsert does any work; losers see `Unavailable`.
//!
//! The attempt runs on its own task, so a caller that gives up does not
//! abandon a claimed mapping. Every claimed attempt ends by recording the
//! mapping `active` or `failed`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    lock,
    migrations::{apply_all, MigrationError, MigrationReport, MigrationSet},
    pool_cache::PoolCache,
    registry::TenantRegistry,
    server::DatabaseServer,
    tenant::database_name,
};
use crate::{
    error::{error_chain, TenantError},
    models::tenant::{MappingStatus, ProvisionClaim, Tenant, TenantDatabase, TenantStatus},
    services::metrics::PROVISIONING_COUNTER,
};

pub type ProvisionFuture = Shared<BoxFuture<'static, Result<TenantDatabase, TenantError>>>;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub database_prefix: String,
    /// Budget for CREATE DATABASE plus the migration run.
    pub timeout: Duration,
    /// A `provisioning` claim older than this is presumed abandoned and may be taken over.
    pub stale_after: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            database_prefix: "tenant_".to_string(),
            timeout: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ProvisionStep {
    #[error("creating database {database}")]
    Create {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("connecting to database {database}")]
    Connect {
        database: String,
        #[source]
        source: TenantError,
    },

    #[error(transparent)]
    Migrate(#[from] MigrationError),
}

struct Inner<S: DatabaseServer, R> {
    registry: Arc<R>,
    pools: Arc<PoolCache<S>>,
    migrations: MigrationSet,
    config: ProvisionerConfig,
    in_flight: std::sync::Mutex<HashMap<Uuid, ProvisionFuture>>,
}

pub struct Provisioner<S: DatabaseServer, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S: DatabaseServer, R> Clone for Provisioner<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> Provisioner<S, R>
where
    S: DatabaseServer,
    R: TenantRegistry,
{
    pub fn new(
        registry: Arc<R>,
        pools: Arc<PoolCache<S>>,
        migrations: MigrationSet,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                pools,
                migrations,
                config,
                in_flight: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.inner.config
    }

    pub fn database_name(&self, tenant: &Tenant) -> String {
        database_name(&self.inner.config.database_prefix, &tenant.slug)
    }

    /// Ensures the tenant's database exists and carries every tenant-scope
    /// migration, then records the mapping `active`.
    ///
    /// Safe to call again after a failure, and on an already-active tenant,
    /// where it applies whatever migrations are pending.
    pub async fn provision(&self, tenant: &Tenant) -> Result<TenantDatabase, TenantError> {
        if tenant.status == TenantStatus::Deleted {
            return Err(TenantError::tenant_not_found(tenant.id));
        }
        self.join(tenant).await
    }

    /// Highest tenant migration this build knows about.
    pub fn schema_version(&self) -> Option<i64> {
        self.inner.migrations.latest_version()
    }

    /// Whether the mapping's database carries every known tenant migration.
    pub fn is_current(&self, mapping: &TenantDatabase) -> bool {
        mapping.status == MappingStatus::Active && mapping.schema_version >= self.schema_version()
    }

    /// The attempt currently running in this process for `tenant`, if any.
    pub fn in_flight(&self, tenant: Uuid) -> Option<ProvisionFuture> {
        lock(&self.inner.in_flight).get(&tenant).cloned()
    }

    fn join(&self, tenant: &Tenant) -> ProvisionFuture {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(attempt) = in_flight.get(&tenant.id) {
            return attempt.clone();
        }

        let inner = Arc::clone(&self.inner);
        let id = tenant.id;
        let tenant = tenant.clone();
        // The task removes its own entry; it cannot do so before this insert
        // because the map lock is held until the end of this function.
        let task = tokio::spawn(async move {
            let result = inner.run(&tenant).await;
            lock(&inner.in_flight).remove(&tenant.id);
            result
        });

        let attempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(TenantError::Internal(format!("provisioning task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(id, attempt.clone());
        attempt
    }
}

impl<S, R> Inner<S, R>
where
    S: DatabaseServer,
    R: TenantRegistry,
{
    async fn run(&self, tenant: &Tenant) -> Result<TenantDatabase, TenantError> {
        let database = database_name(&self.config.database_prefix, &tenant.slug);

        let claim = self
            .registry
            .claim_provisioning(tenant.id, &database, self.config.stale_after)
            .await;
        match claim {
            Ok(ProvisionClaim::Claimed(_)) => {}
            Ok(ProvisionClaim::InProgress(mapping)) => {
                warn!(
                    tenant = %tenant.slug,
                    database = %mapping.database_name,
                    since = %mapping.updated_at,
                    "provisioning already claimed elsewhere"
                );
                PROVISIONING_COUNTER.with_label_values(&["in_progress"]).inc();
                return Err(TenantError::provisioning_in_progress(tenant.id));
            }
            Err(e) => {
                PROVISIONING_COUNTER.with_label_values(&["failure"]).inc();
                return Err(e);
            }
        }

        info!(tenant = %tenant.slug, %database, "provisioning tenant database");
        let outcome = tokio::time::timeout(self.config.timeout, self.prepare(&database)).await;

        match outcome {
            Ok(Ok(report)) => {
                let mapping = self
                    .registry
                    .record_mapping(
                        tenant.id,
                        &database,
                        MappingStatus::Active,
                        None,
                        self.migrations.latest_version(),
                    )
                    .await;
                match mapping {
                    Ok(mapping) => {
                        info!(
                            tenant = %tenant.slug,
                            %database,
                            applied = report.applied.len(),
                            skipped = report.skipped,
                            "tenant database ready"
                        );
                        PROVISIONING_COUNTER.with_label_values(&["success"]).inc();
                        Ok(mapping)
                    }
                    Err(e) => {
                        // The claim goes stale and a later attempt re-runs the no-op steps.
                        error!(tenant = %tenant.slug, %database, "publishing active mapping failed: {e}");
                        PROVISIONING_COUNTER.with_label_values(&["failure"]).inc();
                        Err(e)
                    }
                }
            }
            Ok(Err(step)) => {
                let reason = error_chain(&step);
                error!(tenant = %tenant.slug, %database, "provisioning failed: {reason}");
                self.mark_failed(tenant, &database, &reason).await;
                PROVISIONING_COUNTER.with_label_values(&["failure"]).inc();
                Err(TenantError::ProvisioningFailed {
                    tenant: tenant.id,
                    reason,
                })
            }
            Err(_) => {
                let after = self.config.timeout;
                let reason = format!("provisioning timed out after {}s", after.as_secs());
                error!(tenant = %tenant.slug, %database, "{reason}");
                self.mark_failed(tenant, &database, &reason).await;
                PROVISIONING_COUNTER.with_label_values(&["timeout"]).inc();
                Err(TenantError::Timeout {
                    operation: format!("provisioning database {database}"),
                    after,
                })
            }
        }
    }

    async fn prepare(&self, database: &str) -> Result<MigrationReport, ProvisionStep> {
        let created = self
            .pools
            .server()
            .create_database(database)
            .await
            .map_err(|source| ProvisionStep::Create {
                database: database.to_string(),
                source,
            })?;
        if created {
            info!(database, "created database");
        } else {
            info!(database, "database already exists, continuing");
        }

        let pool = self
            .pools
            .get_pool(database)
            .await
            .map_err(|source| ProvisionStep::Connect {
                database: database.to_string(),
                source,
            })?;

        Ok(apply_all(&self.migrations, pool.pool(), database).await?)
    }

    async fn mark_failed(&self, tenant: &Tenant, database: &str, reason: &str) {
        if let Err(e) = self
            .registry
            .record_mapping(tenant.id, database, MappingStatus::Failed, Some(reason), None)
            .await
        {
            error!(tenant = %tenant.slug, database, "recording failed mapping failed: {e}");
        }
    }
}
