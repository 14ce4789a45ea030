//! A throwaway Postgres for tests that must run the real SQL.
//!
//! One container is started per test binary and shared; every call to
//! [`start`] gets its own freshly migrated control database on it. Tests using
//! this are `#[ignore]`d because they need Docker: run them with
//! `cargo test -- --ignored`.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use sqlx::{postgres::PgConnectOptions, PgPool};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use super::{create_pool, run_control_migrations, DatabaseServer, PgServer};

/// The container plus its mapped port, looked up once so later tests never
/// talk to Docker again.
static CONTAINER: OnceCell<(ContainerAsync<Postgres>, u16)> = OnceCell::const_new();

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

async fn container_port() -> u16 {
    let (_, port) = CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("Failed to start PostgreSQL container");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("Failed to get container port");
            (container, port)
        })
        .await;
    *port
}

pub struct TestPostgres {
    pub server: Arc<PgServer>,
    pub control: PgPool,
    pub control_name: String,
}

/// Connects to the shared container and prepares an isolated control database.
pub async fn start() -> TestPostgres {
    let port = container_port().await;
    let host = std::env::var("TESTCONTAINERS_HOST_OVERRIDE").unwrap_or_else(|_| "localhost".to_string());
    let options = PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username("postgres")
        .password("postgres");
    let server = Arc::new(PgServer::new(options, "postgres", 4, Duration::from_secs(10)));

    let control_name = unique_name("control");
    server
        .create_database(&control_name)
        .await
        .expect("Failed to create control database");
    let control = create_pool(server.options_for(&control_name), 8)
        .await
        .expect("Failed to connect to control database");
    run_control_migrations(&control, &control_name)
        .await
        .expect("Failed to run control migrations");

    TestPostgres {
        server,
        control,
        control_name,
    }
}

/// A database-safe name that no other test in this run uses.
pub fn unique_name(kind: &str) -> String {
    format!(
        "test_{kind}_{}_{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    )
}

/// A slug that passes `validate_slug` and is unique within this run.
pub fn unique_slug(kind: &str) -> String {
    format!("{kind}-{}-{}", std::process::id(), NEXT_ID.fetch_add(1, Ordering::Relaxed))
}
