//! Inventory Core — multi-tenant inventory and reservation engine.

use anyhow::{Context, Result};
use inventory_core::auth::AuthVerifier;
use inventory_core::config::Config;
use inventory_core::db::Db;
use inventory_core::middleware::{RateLimitConfig, RateLimitLayer};
use inventory_core::{build_internal_router, build_router, parse_bind_addr, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;

    let db = Db::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path))?;

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("building http client")?;

    let auth_verifier = AuthVerifier::new(
        config.auth_jwks_url.clone(),
        config.auth_issuer.clone(),
        http_client,
    );
    auth_verifier
        .refresh()
        .await
        .context("initial auth signing key fetch")?;
    auth_verifier.spawn_refresh_task(std::time::Duration::from_secs(24 * 60 * 60));

    let state = AppState::build(db, config, auth_verifier);

    spawn_cache_sweep(state.cache.clone());
    spawn_reconciliation_sweep(state.saga.clone());

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    spawn_rate_limiter_cleanup(rate_limiter.clone());

    let app = build_router(state.clone(), rate_limiter);

    let addr = parse_bind_addr(&state.config.public_bind_addr)
        .context("parsing public bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    let internal_addr = parse_bind_addr(&state.config.internal_bind_addr)
        .context("parsing internal bind address")?;
    let internal_listener = TcpListener::bind(internal_addr)
        .await
        .with_context(|| format!("binding to {internal_addr}"))?;

    tracing::info!(%addr, %internal_addr, "inventory-core listening");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(internal_listener, build_internal_router()).await {
            tracing::error!(%err, "internal listener terminated");
        }
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

fn spawn_cache_sweep(cache: Arc<inventory_core::cache::CacheCoordinator>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            ticker.tick().await;
            cache.sweep_expired();
        }
    });
}

fn spawn_rate_limiter_cleanup(limiter: RateLimitLayer) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(120));
        loop {
            ticker.tick().await;
            limiter.cleanup();
        }
    });
}

fn spawn_reconciliation_sweep(saga: Arc<inventory_core::saga::ProductionSaga>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            match saga.reconcile_drafts(chrono::Duration::seconds(30)).await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "reconciled stale draft production tasks")
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "reconciliation sweep failed"),
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "inventory_core=debug,tower_http=debug".into()))
        .with(fmt::layer())
        .init();
}
