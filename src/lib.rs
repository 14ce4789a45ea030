pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use config::Config;
use db::{
    migrations::{MigrationScope, MigrationSet},
    DatabaseServer, PgServer, PgTenantRegistry, PoolCache, Provisioner, TenantResolver,
};
use services::tenants::TenantService;

pub type Resolver = TenantResolver<PgServer, PgTenantRegistry>;
pub type Tenants = TenantService<PgServer, PgTenantRegistry>;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub control: PgPool,
    pub config: Arc<Config>,
    pub pools: Arc<PoolCache<PgServer>>,
    pub resolver: Arc<Resolver>,
    pub tenants: Arc<Tenants>,
}

impl AppState {
    /// Creates the control database if needed, connects, and applies control
    /// migrations. Failing here means the service must not start.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let server = Arc::new(PgServer::new(
            config.connect_options()?,
            config.admin_db_name.clone(),
            config.tenant_pool_max_connections,
            config.acquire_timeout(),
        ));

        if server.create_database(&config.control_db_name).await? {
            info!("Created control database {}", config.control_db_name);
        }

        let control = db::create_pool(
            server.options_for(&config.control_db_name),
            config.control_pool_max_connections,
        )
        .await?;
        db::run_control_migrations(&control, &config.control_db_name).await?;
        info!("Control database connected and migrations applied");

        Self::from_parts(config, server, control)
    }

    pub fn from_parts(config: Config, server: Arc<PgServer>, control: PgPool) -> anyhow::Result<Self> {
        let registry = Arc::new(PgTenantRegistry::new(control.clone()));
        let pools = Arc::new(PoolCache::new(server, config.pool_cache_config()));
        let provisioner = Provisioner::new(
            registry.clone(),
            pools.clone(),
            MigrationSet::embedded(MigrationScope::Tenant)?,
            config.provisioner_config(),
        );

        let resolver = Arc::new(TenantResolver::new(
            registry.clone(),
            provisioner.clone(),
            pools.clone(),
        ));
        let tenants = Arc::new(TenantService::new(registry, provisioner, pools.clone()));

        Ok(Self {
            control,
            config: Arc::new(config),
            pools,
            resolver,
            tenants,
        })
    }
}
