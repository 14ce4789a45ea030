use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, Counter, CounterVec, Gauge,
    GaugeVec,
};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters (increment on each event) ────────────────────────────
    pub static ref PROVISIONING_COUNTER: CounterVec = register_counter_vec!(
        "dbaas_provisioning_total",
        "Provisioning attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref RESOLVE_COUNTER: CounterVec = register_counter_vec!(
        "dbaas_tenant_resolve_total",
        "Tenant resolutions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref MIGRATIONS_APPLIED_COUNTER: CounterVec = register_counter_vec!(
        "dbaas_migrations_applied_total",
        "Migration scripts executed by scope",
        &["scope"]
    ).unwrap();

    pub static ref POOLS_CREATED_COUNTER: Counter = register_counter!(
        "dbaas_tenant_pools_created_total",
        "Tenant connection pools opened"
    ).unwrap();

    pub static ref POOLS_EVICTED_COUNTER: Counter = register_counter!(
        "dbaas_tenant_pools_evicted_total",
        "Tenant connection pools closed for idleness"
    ).unwrap();

    // ── Live state ──────────────────────────────────────────────────────────
    pub static ref POOLS_OPEN_GAUGE: Gauge = register_gauge!(
        "dbaas_tenant_pools_open",
        "Tenant connection pools currently open"
    ).unwrap();

    pub static ref TENANTS_GAUGE: GaugeVec = register_gauge_vec!(
        "dbaas_tenants",
        "Tenants by lifecycle status",
        &["status"]
    ).unwrap();

    pub static ref MAPPINGS_GAUGE: GaugeVec = register_gauge_vec!(
        "dbaas_tenant_databases",
        "Tenant database mappings by status",
        &["status"]
    ).unwrap();
}

/// Spawn the background collector for registry gauges (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        if let Err(e) = collect(&pool).await {
            warn!("Metrics: initial collection failed: {}", e);
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool).await {
                warn!("Metrics: collection failed: {}", e);
            }
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let tenants: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::TEXT, COUNT(*)::BIGINT FROM tenants GROUP BY status")
            .fetch_all(pool)
            .await?;

    TENANTS_GAUGE.reset();
    for (status, count) in &tenants {
        TENANTS_GAUGE.with_label_values(&[status]).set(*count as f64);
    }

    let mappings: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::TEXT, COUNT(*)::BIGINT FROM tenant_databases GROUP BY status")
            .fetch_all(pool)
            .await?;

    MAPPINGS_GAUGE.reset();
    for (status, count) in &mappings {
        MAPPINGS_GAUGE.with_label_values(&[status]).set(*count as f64);
    }

    let total: i64 = tenants.iter().map(|(_, count)| count).sum();
    info!("Metrics: collected registry gauges for {} tenant(s)", total);
    Ok(())
}
