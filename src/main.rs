use anyhow::Context;
use configserver::{
    cache::ContentCache,
    config::AppConfig,
    db,
    repository::{Registry, Scheduler},
    telemetry,
    vault::Vault,
    web,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logging format depends on the environment, so configuration comes first
    let config = AppConfig::load().context("Failed to load configuration")?;
    telemetry::init(config.is_dev());
    info!("Starting ConfigServer v{}", env!("CARGO_PKG_VERSION"));

    let vault = Arc::new(Vault::from_config(&config.vault).context("Failed to load master key")?);

    let pool = db::queries::connect(&config.database).await?;
    db::init_db(&pool).await?;

    let registry = Arc::new(Registry::from_config(&config));
    if registry.is_empty() {
        warn!("No repositories configured, registrations will be rejected");
    }
    let cache = Arc::new(ContentCache::new(
        config.cache.ttl_secs,
        config.cache.max_entries,
    ));

    let scheduler = Scheduler::from_config(registry.clone(), &config)
        .context("Failed to set up repository sources")?
        .with_cache(cache.clone())
        .start();

    let state = web::AppState::new(registry, vault, pool.clone(), config.secrets.clone(), cache);
    let app = web::create_router(state, &config.web);

    let addr = config.listen_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Web server stopped, stopping scheduler");
    scheduler.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
