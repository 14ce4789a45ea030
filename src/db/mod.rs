pub mod migrations;
pub mod pool_cache;
pub mod provisioner;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod tenant;

#[cfg(test)]
pub(crate) mod test_pg;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use migrations::{MigrationReport, MigrationScope, MigrationSet};

pub use pool_cache::{PoolCache, PoolCacheConfig, PoolHandle};
pub use provisioner::{Provisioner, ProvisionerConfig};
pub use registry::{PgTenantRegistry, TenantRegistry};
pub use resolver::{TenantHandle, TenantResolver};
pub use server::{DatabaseServer, PgServer};

pub async fn create_pool(options: PgConnectOptions, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run the control-scope migrations embedded from ./migrations/control/
pub async fn run_control_migrations(pool: &PgPool, database: &str) -> anyhow::Result<MigrationReport> {
    let set = MigrationSet::embedded(MigrationScope::Control)?;
    let report = migrations::apply_all(&set, pool, database).await?;
    Ok(report)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23505")
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, "23503")
}

pub(crate) fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c == code),
        _ => false,
    }
}
