//! Forward-only, versioned schema migrations for the control database and
//! for every tenant database.
//!
//! Scripts are embedded at build time and ordered by their numeric file
//! prefix (`0001_create_tenants.sql`), never by enumeration order. Each
//! database keeps a `schema_migrations` table keyed by `(scope, version)`.
//!
//! Execution is at-least-once, recording is exactly-once: a script whose
//! record is missing is always re-run, so every script must tolerate running
//! against objects it already created (`IF NOT EXISTS`, guarded `DO` blocks).

use std::{borrow::Cow, collections::BTreeSet, fmt};

use async_trait::async_trait;
use sqlx::{Executor, PgPool};
use tracing::{debug, info};

use crate::services::metrics::MIGRATIONS_APPLIED_COUNTER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MigrationScope {
    Control,
    Tenant,
}

impl MigrationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Tenant => "tenant",
        }
    }
}

impl fmt::Display for MigrationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CONTROL_SCRIPTS: &[(&str, &str)] = &[
    (
        "0001_create_tenants.sql",
        include_str!("../../migrations/control/0001_create_tenants.sql"),
    ),
    (
        "0002_create_tenant_databases.sql",
        include_str!("../../migrations/control/0002_create_tenant_databases.sql"),
    ),
    (
        "0003_add_schema_version.sql",
        include_str!("../../migrations/control/0003_add_schema_version.sql"),
    ),
    (
        "0004_create_users.sql",
        include_str!("../../migrations/control/0004_create_users.sql"),
    ),
];

const TENANT_SCRIPTS: &[(&str, &str)] = &[
    (
        "0001_create_node_types.sql",
        include_str!("../../migrations/tenant/0001_create_node_types.sql"),
    ),
    (
        "0002_create_nodes.sql",
        include_str!("../../migrations/tenant/0002_create_nodes.sql"),
    ),
    (
        "0003_create_relationships.sql",
        include_str!("../../migrations/tenant/0003_create_relationships.sql"),
    ),
];

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("invalid migration file name `{file}`, expected NNNN_description.sql")]
    InvalidFileName { file: String },

    #[error("duplicate {scope} migration version {version}")]
    DuplicateVersion { scope: MigrationScope, version: i64 },

    #[error("migration tracking failed on database {database}")]
    Tracking {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("migration {version:04} ({name}) failed on database {database}")]
    Script {
        database: String,
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: Cow<'static, str>,
}

/// All scripts of one scope, in application order.
#[derive(Debug, Clone)]
pub struct MigrationSet {
    scope: MigrationScope,
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn embedded(scope: MigrationScope) -> Result<Self, MigrationError> {
        let scripts = match scope {
            MigrationScope::Control => CONTROL_SCRIPTS,
            MigrationScope::Tenant => TENANT_SCRIPTS,
        };
        Self::from_scripts(
            scope,
            scripts.iter().map(|(file, sql)| (*file, Cow::Borrowed(*sql))),
        )
    }

    pub fn from_scripts<I, F>(scope: MigrationScope, scripts: I) -> Result<Self, MigrationError>
    where
        I: IntoIterator<Item = (F, Cow<'static, str>)>,
        F: AsRef<str>,
    {
        let mut migrations = scripts
            .into_iter()
            .map(|(file, sql)| {
                let (version, name) = parse_file_name(file.as_ref())?;
                Ok(Migration { version, name, sql })
            })
            .collect::<Result<Vec<_>, MigrationError>>()?;

        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                scope,
                version: pair[0].version,
            });
        }

        Ok(Self { scope, migrations })
    }

    pub fn scope(&self) -> MigrationScope {
        self.scope
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }
}

fn parse_file_name(file: &str) -> Result<(i64, String), MigrationError> {
    let invalid = || MigrationError::InvalidFileName { file: file.to_string() };

    let stem = file
        .strip_suffix(".up.sql")
        .or_else(|| file.strip_suffix(".sql"))
        .ok_or_else(invalid)?;
    let (prefix, name) = stem.split_once('_').ok_or_else(invalid)?;
    if prefix.is_empty() || name.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let version = prefix.parse::<i64>().map_err(|_| invalid())?;
    Ok((version, name.to_string()))
}

/// A database that can hold and apply migrations.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn ensure_tracking_table(&self) -> Result<(), sqlx::Error>;

    async fn applied_versions(&self, scope: MigrationScope) -> Result<BTreeSet<i64>, sqlx::Error>;

    /// Executes the script and records its version as one unit. Returns `false`
    /// without executing anything if the version was recorded concurrently.
    async fn apply(&self, scope: MigrationScope, migration: &Migration) -> Result<bool, sqlx::Error>;
}

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    scope       TEXT NOT NULL,
    version     BIGINT NOT NULL,
    name        TEXT NOT NULL,
    applied_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (scope, version)
)";

/// Advisory lock key serializing migration runners within one database.
const MIGRATION_LOCK_KEY: i64 = 0x6462_6161_735f_6d67;

#[async_trait]
impl MigrationStore for PgPool {
    async fn ensure_tracking_table(&self) -> Result<(), sqlx::Error> {
        // Concurrent CREATE TABLE IF NOT EXISTS can still race on pg_type.
        let mut tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        (&mut *tx).execute(sqlx::raw_sql(TRACKING_TABLE)).await?;
        tx.commit().await
    }

    async fn applied_versions(&self, scope: MigrationScope) -> Result<BTreeSet<i64>, sqlx::Error> {
        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM schema_migrations WHERE scope = $1")
                .bind(scope.as_str())
                .fetch_all(self)
                .await?;
        Ok(versions.into_iter().collect())
    }

    async fn apply(&self, scope: MigrationScope, migration: &Migration) -> Result<bool, sqlx::Error> {
        let mut tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let recorded: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE scope = $1 AND version = $2)",
        )
        .bind(scope.as_str())
        .bind(migration.version)
        .fetch_one(&mut *tx)
        .await?;
        if recorded {
            tx.rollback().await?;
            return Ok(false);
        }

        (&mut *tx).execute(sqlx::raw_sql(&migration.sql)).await?;
        sqlx::query("INSERT INTO schema_migrations (scope, version, name) VALUES ($1, $2, $3)")
            .bind(scope.as_str())
            .bind(migration.version)
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub skipped: usize,
}

/// Brings `store` up to date with `set`, script by script, in version order.
///
/// A failing script stops the run; versions recorded before it stay recorded.
pub async fn apply_all<S>(
    set: &MigrationSet,
    store: &S,
    database: &str,
) -> Result<MigrationReport, MigrationError>
where
    S: MigrationStore + ?Sized,
{
    let scope = set.scope();
    let tracking = |source| MigrationError::Tracking {
        database: database.to_string(),
        source,
    };

    store.ensure_tracking_table().await.map_err(tracking)?;
    let applied = store.applied_versions(scope).await.map_err(tracking)?;

    let mut report = MigrationReport::default();
    for migration in set.migrations() {
        if applied.contains(&migration.version) {
            debug!(%scope, database, version = migration.version, "migration already applied, skipping");
            report.skipped += 1;
            continue;
        }

        info!(%scope, database, version = migration.version, name = %migration.name, "applying migration");
        let executed = store
            .apply(scope, migration)
            .await
            .map_err(|source| MigrationError::Script {
                database: database.to_string(),
                version: migration.version,
                name: migration.name.clone(),
                source,
            })?;

        if executed {
            MIGRATIONS_APPLIED_COUNTER.with_label_values(&[scope.as_str()]).inc();
            report.applied.push(migration.version);
        } else {
            report.skipped += 1;
        }
    }

    if !report.applied.is_empty() {
        info!(%scope, database, applied = ?report.applied, "migrations completed");
    }
    Ok(report)
}


#[cfg(test)]
mod postgres_tests {
    use super::*;
    use crate::db::{test_pg, DatabaseServer};

    async fn fresh_pool(pg: &test_pg::TestPostgres) -> (String, PgPool) {
        let name = test_pg::unique_name("migrate");
        pg.server.create_database(&name).await.unwrap();
        let pool = pg.server.connect(&name).await.unwrap();
        (name, pool)
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn tenant_set_applies_once_against_postgres() {
        let pg = test_pg::start().await;
        let (name, pool) = fresh_pool(&pg).await;
        let set = MigrationSet::embedded(MigrationScope::Tenant).unwrap();

        let first = apply_all(&set, &pool, &name).await.unwrap();
        assert_eq!(first.applied, vec![1, 2, 3]);
        let second = apply_all(&set, &pool, &name).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, 3);

        assert_eq!(pool.applied_versions(MigrationScope::Tenant).await.unwrap().len(), 3);
        for table in ["node_types", "nodes", "relationships"] {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&pool)
                .await
                .unwrap();
            assert!(exists, "{table} missing");
        }
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn scripts_rerun_cleanly_when_their_record_is_lost() {
        let pg = test_pg::start().await;
        let (name, pool) = fresh_pool(&pg).await;
        let set = MigrationSet::embedded(MigrationScope::Control).unwrap();
        apply_all(&set, &pool, &name).await.unwrap();

        sqlx::query("DELETE FROM schema_migrations WHERE scope = 'control'")
            .execute(&pool)
            .await
            .unwrap();
        let report = apply_all(&set, &pool, &name).await.unwrap();
        assert_eq!(report.applied.len(), set.migrations().len());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn failing_script_rolls_back_with_its_record() {
        let pg = test_pg::start().await;
        let (name, pool) = fresh_pool(&pg).await;
        let set = MigrationSet::from_scripts(
            MigrationScope::Tenant,
            vec![
                ("0001_ok.sql", Cow::Borrowed("CREATE TABLE IF NOT EXISTS ok_table (id INT)")),
                ("0002_bad.sql", Cow::Borrowed("CREATE TABLE half_done (id INT); SELECT 1/0")),
            ],
        )
        .unwrap();

        let err = apply_all(&set, &pool, &name).await.unwrap_err();
        assert!(matches!(err, MigrationError::Script { version: 2, .. }), "got {err}");

        let applied = pool.applied_versions(MigrationScope::Tenant).await.unwrap();
        assert_eq!(applied.into_iter().collect::<Vec<_>>(), vec![1]);
        let half_done: bool = sqlx::query_scalar("SELECT to_regclass('half_done') IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!half_done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires Docker"]
    async fn concurrent_runners_execute_each_script_once() {
        let pg = test_pg::start().await;
        let (name, _) = fresh_pool(&pg).await;
        let set = MigrationSet::embedded(MigrationScope::Tenant).unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let server = pg.server.clone();
                let set = set.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    let pool = server.connect(&name).await.unwrap();
                    apply_all(&set, &pool, &name).await.unwrap().applied
                })
            })
            .collect();

        let mut applied = Vec::new();
        for task in tasks {
            applied.extend(task.await.unwrap());
        }
        applied.sort();
        assert_eq!(applied, vec![1, 2, 3]);
    }
}
