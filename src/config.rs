use std::{env, str::FromStr, time::Duration};

use sqlx::postgres::PgConnectOptions;

use crate::db::{PoolCacheConfig, ProvisionerConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub control_db_name: String,
    pub admin_db_name: String,
    pub tenant_db_prefix: String,
    pub control_pool_max_connections: u32,
    pub tenant_pool_max_connections: u32,
    pub pool_acquire_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    pub pool_eviction_interval_secs: u64,
    pub provisioning_timeout_secs: u64,
    pub provisioning_stale_after_secs: u64,
    pub migrate_tenants_on_startup: bool,
    pub host: String,
    pub port: u16,
    pub admin_key: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            control_db_name: env::var("CONTROL_DB_NAME").unwrap_or_else(|_| "dbaas_control".into()),
            admin_db_name: env::var("ADMIN_DB_NAME").unwrap_or_else(|_| "postgres".into()),
            tenant_db_prefix: env::var("TENANT_DB_PREFIX").unwrap_or_else(|_| "tenant_".into()),
            control_pool_max_connections: parsed("CONTROL_POOL_MAX_CONNECTIONS", "10")?,
            tenant_pool_max_connections: parsed("TENANT_POOL_MAX_CONNECTIONS", "10")?,
            pool_acquire_timeout_secs: parsed("POOL_ACQUIRE_TIMEOUT_SECS", "5")?,
            pool_idle_timeout_secs: parsed("POOL_IDLE_TIMEOUT_SECS", "600")?,
            pool_eviction_interval_secs: parsed("POOL_EVICTION_INTERVAL_SECS", "60")?,
            provisioning_timeout_secs: parsed("PROVISIONING_TIMEOUT_SECS", "60")?,
            provisioning_stale_after_secs: parsed("PROVISIONING_STALE_AFTER_SECS", "300")?,
            migrate_tenants_on_startup: parsed("MIGRATE_TENANTS_ON_STARTUP", "true")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("PORT", "8080")?,
            admin_key: required("ADMIN_KEY")?,
        })
    }

    /// Server-level connect options from `DATABASE_URL`. Any database named in
    /// the URL is replaced per pool.
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        PgConnectOptions::from_str(&self.database_url)
            .map_err(|e| anyhow::anyhow!("Invalid DATABASE_URL: {}", e))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.pool_eviction_interval_secs.max(1))
    }

    pub fn pool_cache_config(&self) -> PoolCacheConfig {
        PoolCacheConfig {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            connect_timeout: self.acquire_timeout(),
        }
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            database_prefix: self.tenant_db_prefix.clone(),
            timeout: Duration::from_secs(self.provisioning_timeout_secs),
            stale_after: Duration::from_secs(self.provisioning_stale_after_secs),
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn parsed<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.into());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e))
}
