use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;
use vault_store::{
    config::{AppConfig, RunMode},
    db,
    handlers::health_handlers::HealthState,
    routes,
    services::{reconcile::Reconciler, vault::VaultService},
    storage::build_backend,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!(
        addr = %cfg.addr(),
        database = %cfg.database_url,
        ?mode,
        "starting vault-store"
    );

    // --- Initialize SQLite ---
    let pool = db::connect(&cfg.database_url).await?;
    db::run_migrations(&pool).await?;
    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let backend = build_backend(&cfg.storage)?;
    tracing::info!(backend = backend.backend_name(), "storage backend ready");
    let vault = VaultService::from_pool(pool.clone(), backend.clone(), &cfg.engine);
    let reconciler = Arc::new(Reconciler::new(
        &vault,
        cfg.reconcile.clone(),
        cfg.engine.storage_timeout,
    ));

    if mode == RunMode::ReconcileOnce {
        let report = reconciler.run_once().await?;
        tracing::info!(?report, "reconciliation complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_task = tokio::spawn(reconciler.run(shutdown_rx));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(HealthState {
        pool,
        backend,
        probe_timeout: cfg.engine.storage_timeout,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(err) = reconcile_task.await {
        tracing::warn!(error = %err, "reconciler task ended abnormally");
    }
    Ok(())
}
