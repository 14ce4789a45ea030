//! In-memory stand-ins for Postgres used by the unit tests: a database server
//! that counts what it builds, and a registry with the same uniqueness and
//! claim rules as the `tenants` / `tenant_databases` tables.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    lock,
    migrations::{Migration, MigrationScope, MigrationStore},
    registry::TenantRegistry,
    server::DatabaseServer,
};
use crate::{
    error::TenantError,
    models::tenant::{
        MappingStatus, ProvisionClaim, Tenant, TenantDatabase, TenantStatus, UpdateTenantRequest,
    },
};

#[derive(Debug, Default)]
struct Controls {
    create_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    migration_delay: Mutex<Duration>,
    fail_create: AtomicBool,
    fail_connect: AtomicBool,
    failing_versions: Mutex<HashSet<i64>>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tracking_table: bool,
    executed: Vec<(MigrationScope, i64)>,
    recorded: BTreeSet<(MigrationScope, i64)>,
}

#[derive(Debug)]
pub struct FakeDatabase {
    pub name: String,
    state: Mutex<DatabaseState>,
}

impl FakeDatabase {
    /// Every script execution in order, including re-executions.
    pub fn executed(&self, scope: MigrationScope) -> Vec<i64> {
        lock(&self.state)
            .executed
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn recorded(&self, scope: MigrationScope) -> Vec<i64> {
        lock(&self.state)
            .recorded
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Drops a tracking record while leaving the executed script in place.
    pub fn forget(&self, scope: MigrationScope, version: i64) {
        lock(&self.state).recorded.remove(&(scope, version));
    }
}

#[derive(Debug, Clone)]
pub struct FakePool {
    pub id: u64,
    pub database: Arc<FakeDatabase>,
    closed: Arc<AtomicBool>,
    controls: Arc<Controls>,
}

impl FakePool {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MigrationStore for FakePool {
    async fn ensure_tracking_table(&self) -> Result<(), sqlx::Error> {
        lock(&self.database.state).tracking_table = true;
        Ok(())
    }

    async fn applied_versions(&self, scope: MigrationScope) -> Result<BTreeSet<i64>, sqlx::Error> {
        Ok(self.database.recorded(scope).into_iter().collect())
    }

    async fn apply(&self, scope: MigrationScope, migration: &Migration) -> Result<bool, sqlx::Error> {
        let delay = *lock(&self.controls.migration_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.controls.failing_versions).contains(&migration.version) {
            return Err(sqlx::Error::Protocol(format!(
                "injected failure in migration {}",
                migration.version
            )));
        }

        let mut state = lock(&self.database.state);
        if !state.tracking_table {
            return Err(sqlx::Error::Protocol("schema_migrations does not exist".into()));
        }
        if state.recorded.contains(&(scope, migration.version)) {
            return Ok(false);
        }
        state.executed.push((scope, migration.version));
        state.recorded.insert((scope, migration.version));
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct FakeServer {
    databases: Mutex<HashMap<String, Arc<FakeDatabase>>>,
    controls: Arc<Controls>,
    create_calls: AtomicUsize,
    created: AtomicUsize,
    pools_built: AtomicU64,
    pools_closed: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn database(&self, name: &str) -> Option<Arc<FakeDatabase>> {
        lock(&self.databases).get(name).cloned()
    }

    pub fn database_count(&self) -> usize {
        lock(&self.databases).len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Databases that did not exist before their `create_database` call.
    pub fn databases_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn pools_built(&self) -> u64 {
        self.pools_built.load(Ordering::SeqCst)
    }

    pub fn pools_closed(&self) -> usize {
        self.pools_closed.load(Ordering::SeqCst)
    }

    pub fn fail_migration(&self, version: i64) {
        lock(&self.controls.failing_versions).insert(version);
    }

    pub fn fail_create(&self, fail: bool) {
        self.controls.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.controls.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        lock(&self.controls.failing_versions).clear();
        self.fail_create(false);
        self.fail_connect(false);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.controls.create_delay) = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.controls.connect_delay) = delay;
    }

    pub fn set_migration_delay(&self, delay: Duration) {
        *lock(&self.controls.migration_delay) = delay;
    }
}

#[async_trait]
impl DatabaseServer for FakeServer {
    type Pool = FakePool;

    async fn create_database(&self, name: &str) -> Result<bool, sqlx::Error> {
        let delay = *lock(&self.controls.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_create.load(Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol("injected CREATE DATABASE failure".into()));
        }

        let mut databases = lock(&self.databases);
        if databases.contains_key(name) {
            return Ok(false);
        }
        databases.insert(
            name.to_string(),
            Arc::new(FakeDatabase {
                name: name.to_string(),
                state: Mutex::default(),
            }),
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn drop_database(&self, name: &str) -> Result<(), sqlx::Error> {
        lock(&self.databases).remove(name);
        Ok(())
    }

    async fn connect(&self, name: &str) -> Result<FakePool, sqlx::Error> {
        let delay = *lock(&self.controls.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.controls.fail_connect.load(Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol("injected connection failure".into()));
        }
        let database = self
            .database(name)
            .ok_or_else(|| sqlx::Error::Protocol(format!("database \"{name}\" does not exist")))?;
        let id = self.pools_built.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakePool {
            id,
            database,
            closed: Arc::new(AtomicBool::new(false)),
            controls: self.controls.clone(),
        })
    }

    async fn close(&self, pool: &FakePool) {
        pool.closed.store(true, Ordering::SeqCst);
        self.pools_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    tenants: HashMap<Uuid, Tenant>,
    mappings: HashMap<Uuid, TenantDatabase>,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
    claims: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful provisioning claims so far.
    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    /// Backdates a mapping, simulating a crashed provisioner.
    pub fn age_mapping(&self, id: Uuid, by: Duration) {
        if let Some(mapping) = lock(&self.state).mappings.get_mut(&id) {
            mapping.updated_at -= chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    /// Rewinds the recorded schema version, as left behind by an older release.
    pub fn set_schema_version(&self, id: Uuid, version: Option<i64>) {
        if let Some(mapping) = lock(&self.state).mappings.get_mut(&id) {
            mapping.schema_version = version;
        }
    }
}

#[async_trait]
impl TenantRegistry for MemoryRegistry {
    async fn create_tenant(&self, slug: &str, name: &str) -> Result<Tenant, TenantError> {
        let mut state = lock(&self.state);
        if state.tenants.values().any(|t| t.slug == slug) {
            return Err(TenantError::Conflict(format!(
                "tenant with slug '{slug}' already exists"
            )));
        }
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Tenant, TenantError> {
        lock(&self.state)
            .tenants
            .get(&id)
            .cloned()
            .ok_or_else(|| TenantError::tenant_not_found(id))
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Tenant, TenantError> {
        lock(&self.state)
            .tenants
            .values()
            .find(|t| t.slug == slug)
            .cloned()
            .ok_or_else(|| TenantError::NotFound(format!("tenant not found: {slug}")))
    }

    async fn list_tenants(&self, limit: i64, offset: i64) -> Result<(Vec<Tenant>, i64), TenantError> {
        let state = lock(&self.state);
        let mut tenants: Vec<Tenant> = state.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.slug.cmp(&b.slug)));
        let total = tenants.len() as i64;
        let page = tenants
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn update_tenant(&self, id: Uuid, changes: &UpdateTenantRequest) -> Result<Tenant, TenantError> {
        let mut state = lock(&self.state);
        let tenant = state
            .tenants
            .get_mut(&id)
            .ok_or_else(|| TenantError::tenant_not_found(id))?;
        if let Some(name) = &changes.name {
            tenant.name = name.clone();
        }
        if let Some(status) = changes.status {
            tenant.status = status;
        }
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<(), TenantError> {
        let mut state = lock(&self.state);
        state
            .tenants
            .remove(&id)
            .ok_or_else(|| TenantError::tenant_not_found(id))?;
        state.mappings.remove(&id);
        Ok(())
    }

    async fn get_mapping(&self, id: Uuid) -> Result<TenantDatabase, TenantError> {
        lock(&self.state)
            .mappings
            .get(&id)
            .cloned()
            .ok_or_else(|| TenantError::NotFound(format!("no database mapping for tenant {id}")))
    }

    async fn list_mappings(&self) -> Result<Vec<TenantDatabase>, TenantError> {
        Ok(lock(&self.state).mappings.values().cloned().collect())
    }

    async fn record_mapping(
        &self,
        id: Uuid,
        database_name: &str,
        status: MappingStatus,
        last_error: Option<&str>,
        schema_version: Option<i64>,
    ) -> Result<TenantDatabase, TenantError> {
        let mut state = lock(&self.state);
        if !state.tenants.contains_key(&id) {
            return Err(TenantError::tenant_not_found(id));
        }
        let now = Utc::now();
        let mapping = state.mappings.entry(id).or_insert_with(|| TenantDatabase {
            tenant_id: id,
            database_name: database_name.to_string(),
            status,
            last_error: None,
            schema_version: None,
            created_at: now,
            updated_at: now,
        });
        mapping.database_name = database_name.to_string();
        mapping.status = status;
        mapping.last_error = last_error.map(str::to_string);
        if schema_version.is_some() {
            mapping.schema_version = schema_version;
        }
        mapping.updated_at = now;
        Ok(mapping.clone())
    }

    async fn claim_provisioning(
        &self,
        id: Uuid,
        database_name: &str,
        stale_after: Duration,
    ) -> Result<ProvisionClaim, TenantError> {
        let mut state = lock(&self.state);
        if !state.tenants.contains_key(&id) {
            return Err(TenantError::tenant_not_found(id));
        }
        let now = Utc::now();
        let stale_before = now - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        if let Some(existing) = state.mappings.get(&id) {
            if existing.status == MappingStatus::Provisioning && existing.updated_at >= stale_before {
                return Ok(ProvisionClaim::InProgress(existing.clone()));
            }
        }

        let mapping = state.mappings.entry(id).or_insert_with(|| TenantDatabase {
            tenant_id: id,
            database_name: database_name.to_string(),
            status: MappingStatus::Provisioning,
            last_error: None,
            schema_version: None,
            created_at: now,
            updated_at: now,
        });
        mapping.database_name = database_name.to_string();
        mapping.status = MappingStatus::Provisioning;
        mapping.last_error = None;
        mapping.updated_at = now;
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(ProvisionClaim::Claimed(mapping.clone()))
    }
}
