use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool};

use super::{has_sqlstate, is_unique_violation, migrations::MigrationStore, tenant::quote_identifier};

/// The physical database server tenant databases live on.
#[async_trait]
pub trait DatabaseServer: Send + Sync + 'static {
    type Pool: MigrationStore + Clone + Send + Sync + 'static;

    /// Returns `true` if the database was created, `false` if it already existed.
    async fn create_database(&self, name: &str) -> Result<bool, sqlx::Error>;

    async fn drop_database(&self, name: &str) -> Result<(), sqlx::Error>;

    /// Opens a bounded connection pool to `name`.
    async fn connect(&self, name: &str) -> Result<Self::Pool, sqlx::Error>;

    async fn close(&self, pool: &Self::Pool);
}

#[derive(Debug, Clone)]
pub struct PgServer {
    options: PgConnectOptions,
    admin_database: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgServer {
    pub fn new(
        options: PgConnectOptions,
        admin_database: impl Into<String>,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            options,
            admin_database: admin_database.into(),
            max_connections,
            acquire_timeout,
        }
    }

    pub fn options_for(&self, database: &str) -> PgConnectOptions {
        self.options.clone().database(database)
    }

    async fn admin_connection(&self) -> Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&self.options_for(&self.admin_database)).await
    }
}

#[async_trait]
impl DatabaseServer for PgServer {
    type Pool = PgPool;

    async fn create_database(&self, name: &str) -> Result<bool, sqlx::Error> {
        let mut conn = self.admin_connection().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&mut conn)
                .await?;

        let result = if exists {
            Ok(false)
        } else {
            let sql = format!("CREATE DATABASE {}", quote_identifier(name));
            match (&mut conn).execute(sqlx::raw_sql(&sql)).await {
                Ok(_) => Ok(true),
                // 42P04 duplicate_database; two concurrent CREATEs can also collide on
                // the pg_database unique index.
                Err(e) if has_sqlstate(&e, "42P04") || is_unique_violation(&e) => Ok(false),
                Err(e) => Err(e),
            }
        };

        if let Err(e) = conn.close().await {
            tracing::warn!("closing admin connection failed: {e}");
        }
        result
    }

    async fn drop_database(&self, name: &str) -> Result<(), sqlx::Error> {
        let mut conn = self.admin_connection().await?;
        let sql = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_identifier(name));
        let result = (&mut conn).execute(sqlx::raw_sql(&sql)).await.map(|_| ());
        if let Err(e) = conn.close().await {
            tracing::warn!("closing admin connection failed: {e}");
        }
        result
    }

    async fn connect(&self, name: &str) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.options_for(name))
            .await
    }

    async fn close(&self, pool: &PgPool) {
        pool.close().await;
    }
}
