//! Inventory Core — a multi-tenant inventory and reservation engine.
//!
//! Exposes the domain modules and `AppState`/router assembly so both
//! `main.rs` and the integration tests under `tests/` can build the same
//! Axum application.

pub mod admin;
pub mod api;
pub mod auth;
pub mod balance;
pub mod cache;
pub mod catalog;
pub mod classifier;
pub mod codes;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod operations;
pub mod reservation;
pub mod saga;
pub mod snapshot;

use crate::admin::AdminAdjustment;
use crate::auth::AuthVerifier;
use crate::balance::BalanceCalculator;
use crate::cache::CacheCoordinator;
use crate::catalog::Catalog;
use crate::classifier::ClassifierRegistry;
use crate::config::Config;
use crate::db::Db;
use crate::middleware::{rate_limit::rate_limit_middleware, RateLimitLayer};
use crate::reservation::ReservationEngine;
use crate::saga::ProductionSaga;
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared application state, constructed once at startup.
pub struct AppState {
    pub db: Db,
    pub config: Config,
    pub classifiers: Arc<ClassifierRegistry>,
    pub catalog: Catalog,
    pub cache: Arc<CacheCoordinator>,
    pub balances: Arc<BalanceCalculator>,
    pub reservations: Arc<ReservationEngine>,
    pub saga: Arc<ProductionSaga>,
    pub admin: AdminAdjustment,
    pub auth_verifier: Arc<AuthVerifier>,
}

impl AppState {
    pub fn build(db: Db, config: Config, auth_verifier: Arc<AuthVerifier>) -> Arc<Self> {
        let classifiers = Arc::new(ClassifierRegistry::new(
            db.clone(),
            config.classifier_cache_ttl,
        ));
        let catalog = Catalog::new(db.clone());
        let cache = Arc::new(CacheCoordinator::new(config.balance_cache_ttl));
        let balances = Arc::new(BalanceCalculator::new(db.clone(), cache.clone()));
        let reservations = Arc::new(ReservationEngine::new(
            db.clone(),
            classifiers.clone(),
            cache.clone(),
        ));
        let saga = Arc::new(ProductionSaga::new(
            db.clone(),
            reservations.clone(),
            cache.clone(),
            classifiers.clone(),
        ));
        let admin = AdminAdjustment::new(
            db.clone(),
            classifiers.clone(),
            balances.clone(),
            cache.clone(),
        );

        Arc::new(Self {
            db,
            config,
            classifiers,
            catalog,
            cache,
            balances,
            reservations,
            saga,
            admin,
            auth_verifier,
        })
    }
}

/// Builds the full Axum router: public routes need no auth, the rest sit
/// behind `auth_middleware`, mirroring the public/protected split the
/// codebase's bootstrap already uses. Callers must serve this with
/// `into_make_service_with_connect_info::<SocketAddr>()` since both the
/// rate limiter and request logger extract the caller's address.
pub fn build_router(state: Arc<AppState>, rate_limiter: RateLimitLayer) -> Router {
    let protected = Router::new()
        .route("/inventory", get(api::routes::get_inventory))
        .route("/items/details", post(api::routes::get_item_details))
        .route("/inventory/reserve", post(api::routes::reserve))
        .route("/inventory/return-reserve", post(api::routes::return_reserve))
        .route("/inventory/consume-reserve", post(api::routes::consume_reserve))
        .route(
            "/inventory/reservation-status/:operation_id",
            get(api::routes::reservation_status),
        )
        .route("/production/start", post(api::routes::start_production))
        .route("/production/complete", post(api::routes::complete_production))
        .route("/production/claim", post(api::routes::claim_production))
        .route("/production/cancel", post(api::routes::cancel_production))
        .route_layer(from_fn_with_state(
            state.auth_verifier.clone(),
            auth::auth_middleware,
        ));

    let admin_routes = Router::new()
        .route("/admin/inventory/adjust", post(api::routes::admin_adjust))
        .route("/inventory/add-items", post(api::routes::add_items))
        .route_layer(axum::middleware::from_fn(auth::require_admin))
        .route_layer(from_fn_with_state(
            state.auth_verifier.clone(),
            auth::auth_middleware,
        ));

    let public = Router::new().route("/health", get(api::routes::health));

    Router::new()
        .merge(public)
        .merge(protected)
        .merge(admin_routes)
        .layer(from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Minimal router for the internal bind address: health checks only, no
/// auth/rate-limiting, for load balancers and orchestrators that live on a
/// network segment separate from player-facing traffic. Uses the
/// `ConnectInfo`-free logging variant since this listener isn't expected to
/// be served behind `into_make_service_with_connect_info`.
pub fn build_internal_router() -> Router {
    Router::new()
        .route("/health", get(api::routes::health))
        .layer(axum::middleware::from_fn(
            middleware::request_logging_simple,
        ))
}

pub fn parse_bind_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {addr}: {e}"))
}
