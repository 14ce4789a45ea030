/// Re-run provisioning for tenant databases: creates missing databases and
/// applies pending migrations. The recovery path for `failed` mappings.
///
/// Usage: provision-tenants [--tenant SLUG] [--failed-only]
///   --tenant SLUG   : Provision only this tenant (optional, all if not specified)
///   --failed-only   : Only retry tenants whose last provisioning failed, or
///                     that have no database mapping yet

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbaas_api::{
    config::Config,
    db::TenantRegistry,
    models::tenant::{MappingStatus, TenantStatus},
    AppState,
};

#[derive(Parser)]
#[command(name = "provision-tenants", about = "Provision or repair tenant databases")]
struct Args {
    /// Tenant slug to provision (optional, all if not specified)
    #[arg(long)]
    tenant: Option<String>,

    /// Only retry tenants whose last provisioning failed, or that have no database mapping yet
    #[arg(long)]
    failed_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = AppState::connect(Config::from_env()?).await?;
    let registry = dbaas_api::db::PgTenantRegistry::new(state.control.clone());

    let tenants = match &args.tenant {
        Some(slug) => vec![registry.get_tenant_by_slug(slug).await?],
        None => {
            let (tenants, total) = registry.list_tenants(i64::MAX, 0).await?;
            info!("Found {} tenant(s)", total);
            tenants
        }
    };

    let mut provisioned = 0usize;
    let mut failed = 0usize;
    for tenant in tenants {
        if tenant.status == TenantStatus::Deleted {
            continue;
        }
        if args.failed_only {
            match registry.get_mapping(tenant.id).await {
                Ok(mapping) if mapping.status != MappingStatus::Failed => continue,
                _ => {}
            }
        }

        match state.tenants.reprovision(tenant.id).await {
            Ok(details) => {
                provisioned += 1;
                let database = details.database.map(|m| m.database_name).unwrap_or_default();
                info!("Provisioned tenant {} ({})", tenant.slug, database);
            }
            Err(e) => {
                failed += 1;
                error!("Provisioning failed for tenant {}: {}", tenant.slug, e);
            }
        }
    }

    state.pools.close_all().await;

    if failed > 0 {
        warn!("{} provisioned, {} failed", provisioned, failed);
        anyhow::bail!("{} tenant(s) failed to provision", failed);
    }
    info!("{} tenant(s) provisioned", provisioned);
    Ok(())
}
