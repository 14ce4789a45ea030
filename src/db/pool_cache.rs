//! One live connection pool per physical database, built lazily and shared
//! across requests.
//!
//! Construction is single-flight per database name: every caller for a name
//! goes through the same `OnceCell`, so concurrent first accesses build one
//! pool. Callers hold a [`PoolHandle`] lease while they use a pool; leases are
//! taken under the map lock, and eviction checks them under that same lock, so
//! a pool with checkouts in flight is never closed by the evictor.

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::OnceCell, task::JoinHandle, time::Instant};
use tracing::{debug, info};

use super::{lock, server::DatabaseServer};
use crate::{
    error::TenantError,
    services::metrics::{POOLS_CREATED_COUNTER, POOLS_EVICTED_COUNTER, POOLS_OPEN_GAUGE},
};

#[derive(Debug, Clone)]
pub struct PoolCacheConfig {
    /// Pools without leases for longer than this are closed by [`PoolCache::evict_idle`].
    pub idle_timeout: Duration,
    /// Upper bound on building a pool (its first connection included).
    pub connect_timeout: Duration,
}

impl Default for PoolCacheConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Entry<P> {
    database: String,
    pool: P,
    created_at: Instant,
    last_used: Mutex<Instant>,
    leases: AtomicUsize,
}

impl<P> Entry<P> {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_used))
    }
}

type Slot<P> = Arc<OnceCell<Arc<Entry<P>>>>;

pub struct PoolCache<S: DatabaseServer> {
    server: Arc<S>,
    config: PoolCacheConfig,
    slots: Mutex<HashMap<String, Slot<S::Pool>>>,
}

impl<S: DatabaseServer> PoolCache<S> {
    pub fn new(server: Arc<S>, config: PoolCacheConfig) -> Self {
        Self {
            server,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn server(&self) -> &Arc<S> {
        &self.server
    }

    /// Returns a lease on the pool for `database`, building it on first use.
    pub async fn get_pool(&self, database: &str) -> Result<PoolHandle<S::Pool>, TenantError> {
        self.get_or_build(database).await.map(|(handle, _)| handle)
    }

    /// Like [`get_pool`](Self::get_pool), also reporting whether this call
    /// built the pool rather than finding it cached.
    pub async fn get_or_build(
        &self,
        database: &str,
    ) -> Result<(PoolHandle<S::Pool>, bool), TenantError> {
        let mut built_any = false;
        loop {
            let slot = lock(&self.slots)
                .entry(database.to_string())
                .or_default()
                .clone();

            let mut built = false;
            let entry = slot
                .get_or_try_init(|| {
                    built = true;
                    self.build(database)
                })
                .await?
                .clone();
            built_any |= built;

            if let Some(handle) = self.lease(database, &slot, entry.clone()) {
                return Ok((handle, built_any));
            }

            // The slot was removed while we were building or observing it. A
            // remover only closes entries that were already initialized, so a
            // pool finished after the removal belongs to its builder.
            if built {
                debug!(database, "pool slot removed during construction, closing the new pool");
                self.close_entry(&entry).await;
            } else {
                debug!(database, "pool slot changed during lookup, retrying");
            }
        }
    }

    fn lease(
        &self,
        database: &str,
        slot: &Slot<S::Pool>,
        entry: Arc<Entry<S::Pool>>,
    ) -> Option<PoolHandle<S::Pool>> {
        let slots = lock(&self.slots);
        match slots.get(database) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                entry.leases.fetch_add(1, Ordering::AcqRel);
                Some(PoolHandle { entry })
            }
            _ => None,
        }
    }

    async fn build(&self, database: &str) -> Result<Arc<Entry<S::Pool>>, TenantError> {
        let timeout = self.config.connect_timeout;
        let pool = tokio::time::timeout(timeout, self.server.connect(database))
            .await
            .map_err(|_| TenantError::Timeout {
                operation: format!("connecting to database {database}"),
                after: timeout,
            })??;

        info!(database, "opened connection pool");
        POOLS_CREATED_COUNTER.inc();
        POOLS_OPEN_GAUGE.inc();

        let now = Instant::now();
        Ok(Arc::new(Entry {
            database: database.to_string(),
            pool,
            created_at: now,
            last_used: Mutex::new(now),
            leases: AtomicUsize::new(0),
        }))
    }

    /// Closes and forgets every pool idle past the configured threshold.
    /// Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let evicted: Vec<Arc<Entry<S::Pool>>> = {
            let mut slots = lock(&self.slots);
            let mut evicted = Vec::new();
            slots.retain(|_, slot| match slot.get() {
                Some(entry) => {
                    let idle = entry.leases.load(Ordering::Acquire) == 0
                        && entry.idle_for(now) > idle_timeout;
                    if idle {
                        evicted.push(entry.clone());
                    }
                    !idle
                }
                // Empty cell: keep it while someone is still constructing through it.
                None => Arc::strong_count(slot) > 1,
            });
            evicted
        };

        for entry in &evicted {
            info!(
                database = %entry.database,
                age_secs = now.saturating_duration_since(entry.created_at).as_secs(),
                "evicting idle connection pool"
            );
            self.close_entry(entry).await;
            POOLS_EVICTED_COUNTER.inc();
        }
        evicted.len()
    }

    /// Removes and closes the pool for `database` regardless of leases.
    /// Used when the database itself is going away.
    pub async fn remove(&self, database: &str) -> bool {
        let slot = lock(&self.slots).remove(database);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(entry) => {
                info!(database, "closing connection pool");
                self.close_entry(&entry).await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot<S::Pool>> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        let entries: Vec<_> = slots.iter().filter_map(|slot| slot.get().cloned()).collect();
        info!(count = entries.len(), "closing all tenant connection pools");
        for entry in &entries {
            self.close_entry(entry).await;
        }
    }

    async fn close_entry(&self, entry: &Entry<S::Pool>) {
        self.server.close(&entry.pool).await;
        POOLS_OPEN_GAUGE.dec();
    }

    /// Number of live pools.
    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `interval` until the task is aborted.
    pub fn spawn_evictor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.evict_idle().await;
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "idle pool sweep");
                }
            }
        })
    }
}

/// A lease on a cached pool. The pool cannot be evicted while any lease is alive.
pub struct PoolHandle<P> {
    entry: Arc<Entry<P>>,
}

impl<P> PoolHandle<P> {
    pub fn pool(&self) -> &P {
        &self.entry.pool
    }

    pub fn database(&self) -> &str {
        &self.entry.database
    }
}

impl<P> Deref for PoolHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.entry.pool
    }
}

impl<P> Clone for PoolHandle<P> {
    fn clone(&self) -> Self {
        self.entry.leases.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<P> Drop for PoolHandle<P> {
    fn drop(&mut self) {
        // Touch before releasing so the evictor never sees a zero-lease entry
        // with a stale timestamp.
        *lock(&self.entry.last_used) = Instant::now();
        self.entry.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<P> fmt::Debug for PoolHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("database", &self.entry.database)
            .field("leases", &self.entry.leases.load(Ordering::Relaxed))
            .finish()
    }
}
