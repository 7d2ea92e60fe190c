// keyproxy — reverse proxy entry point.
// All subsystems (config, keys, penalty box, usage ledger, health worker)
// are constructed once here and handed to axum as shared state.

pub mod archival;
pub mod auth;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod http_client;
pub mod keys;
pub mod logs;
pub mod penalty;
pub mod ratelimits;
pub mod routes;
pub mod selector;
pub mod state;
pub mod tail_parser;
pub mod usage;

use axum::routing::{any, get, post};
use axum::Router;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use health::{HealthSnapshotCache, HealthWorker};
use keys::KeyStore;
use penalty::PenaltyRegistry;
use ratelimits::RateLimitCache;
use state::AppState;
use usage::UsageLedger;

#[tokio::main]
async fn main() {
    logs::RingBufferLogger::init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[keyproxy] startup failed: {e}");
            std::process::exit(1);
        }
    };

    let usage_db_path = config.data_dir.join("usage.sqlite3");
    let usage = match UsageLedger::open(&usage_db_path) {
        Ok(u) => Arc::new(u),
        Err(e) => {
            log::error!("[keyproxy] failed to open usage ledger: {e}");
            std::process::exit(1);
        }
    };

    let keys = Arc::new(KeyStore::new(config.keys.clone()));
    let penalties = Arc::new(PenaltyRegistry::new());
    let health_snapshot = Arc::new(HealthSnapshotCache::new());
    let ratelimits = RateLimitCache::new();
    let client = http_client::upstream_client();

    let worker = HealthWorker::new(
        keys.clone(),
        penalties.clone(),
        usage.clone(),
        config.upstream_base_url.clone(),
        health_snapshot.clone(),
    );
    let health_stop = worker.stop_handle();

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        keys,
        penalties,
        usage,
        ratelimits,
        health: health_snapshot,
        client,
        health_stop,
    });

    health::spawn(worker);

    let operator_routes = Router::new()
        .route("/stats", get(routes::stats))
        .route("/stats/minute", get(routes::stats_minute))
        .route("/stats/24h", get(routes::stats_24h))
        .route("/queries", get(routes::queries))
        .route("/queries/:id/body", get(routes::query_body))
        .route("/logs", get(routes::logs))
        .route("/ratelimits", get(routes::ratelimits))
        .route("/health/keys", get(routes::health_keys))
        .route("/health/keys/:i/reset", post(routes::reset_key))
        .route("/health/keys/:i/penalize", post(routes::penalize_key))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/dashboard", get(routes::dashboard))
        .route("/", get(routes::dashboard))
        .merge(operator_routes)
        .route(
            "/*path",
            any(dispatcher::proxy_handler).route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth::require_auth,
            )),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{port}");
    log::info!("[keyproxy] listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("[keyproxy] failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("[keyproxy] shutdown signal received, stopping health worker");
        shutdown_state.health_stop.store(true, Ordering::Relaxed);
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    {
        log::error!("[keyproxy] server error: {e}");
    }
}
