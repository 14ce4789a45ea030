use axum::http::{header, Method};
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbaas_api::{
    config::Config,
    middleware::{admin::ADMIN_KEY_HEADER, tenant::TENANT_HEADER},
    routes, services, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let migrate_on_startup = config.migrate_tenants_on_startup;

    let state = AppState::connect(config).await?;

    if migrate_on_startup {
        match state.tenants.migrate_existing().await {
            Ok(summary) if summary.failed > 0 => {
                warn!("{} tenant database(s) failed to migrate, see logs", summary.failed)
            }
            Ok(_) => {}
            Err(e) => warn!("Tenant migration sweep aborted: {}", e),
        }
    }

    services::metrics::start(state.control.clone());
    let evictor = state.pools.spawn_evictor(state.config.eviction_interval());

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static(TENANT_HEADER),
            header::HeaderName::from_static(ADMIN_KEY_HEADER),
        ]))
        .allow_origin(Any);

    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!("dbaas API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    evictor.abort();
    state.pools.close_all().await;
    state.control.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}
