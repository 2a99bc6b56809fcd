use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use docledger::auth::jwt::JwtService;
use docledger::config::AppConfig;
use docledger::db;
use docledger::routes;
use docledger::s3::build_storage;
use docledger::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        s3_bucket = %config.s3_bucket,
        version_create_max_attempts = config.version_create_max_attempts,
        max_upload_bytes = config.max_upload_bytes,
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get().context("failed to get database connection")?;
        let applied = db::run_migrations(&mut conn)?;
        tracing::info!(applied, "database schema is up to date");
    }

    let storage = Arc::new(build_storage(&config).await?);
    let jwt = JwtService::from_config(&config)?;

    let listen_addr: SocketAddr =
        format!("{}:{}", config.server_host, config.server_port).parse()?;
    let state = AppState::new(pool, config, storage, jwt);
    let router = routes::create_router(state)?;

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
