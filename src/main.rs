//! Deferred settlement facilitator HTTP entrypoint.
//!
//! Launches the Axum server exposing verification, queueing, settlement,
//! dispute, and monitoring endpoints, and starts the background settlement
//! scheduler and metrics snapshot task.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `SETTLEMENT_THRESHOLD_*`, `AUTO_SETTLEMENT`, `SETTLEMENT_CHECK_INTERVAL`
//!   control batching behavior
//! - `SOLANA_RPC_URL`, `USDC_MINT`, `SOLANA_PRIVATE_KEY` configure on-chain
//!   dispatch
//! - `OTEL_*` variables enable tracing export

use axum::http::Method;
use dotenvy::dotenv;
use solana_keypair::Keypair;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use x402_deferred::config::Config;
use x402_deferred::engine::SettlementEngine;
use x402_deferred::handlers::{self, AppState};
use x402_deferred::monitoring::Monitoring;
use x402_deferred::signer::{Signer, SolanaSigner, UnconfiguredSigner};
use x402_deferred::state::FacilitatorState;
use x402_deferred::telemetry::Telemetry;

#[tokio::main]
async fn main() {
    // Load .env variables
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let state = FacilitatorState::shared();
    let signer = build_signer(&config);
    let engine = Arc::new(SettlementEngine::new(
        state.clone(),
        signer,
        config.thresholds(),
        config.check_interval(),
        config.usdc_mint().to_string(),
    ));
    let monitoring = Arc::new(Monitoring::new(
        state.clone(),
        engine.clone(),
        config.auto_settlement(),
        config.snapshot_interval(),
    ));

    if config.auto_settlement() {
        engine.start().await;
    } else {
        tracing::info!("automatic settlement disabled; use POST /settlement/trigger or /settlement/start");
    }
    monitoring.start_snapshots().await;

    let app_state = AppState {
        state,
        engine: Arc::clone(&engine),
        monitoring: Arc::clone(&monitoring),
    };
    let app = handlers::routes()
        .with_state(app_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            "status={} elapsed={}ms",
                            response.status().as_u16(),
                            latency.as_millis()
                        );
                    },
                ),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting deferred settlement facilitator at http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    // An in-flight on-chain call finishes before the tasks wind down.
    engine.stop().await;
    monitoring.stop_snapshots().await;
    tracing::info!("Shutdown complete");
}

fn build_signer(config: &Config) -> Arc<dyn Signer> {
    match config.solana_private_key() {
        Some(key) => {
            let keypair = Keypair::from_base58_string(key);
            let signer = SolanaSigner::new(config.solana_rpc_url(), keypair);
            tracing::info!(operator = %signer.operator_address(), "on-chain signer configured");
            Arc::new(signer)
        }
        None => {
            tracing::warn!(
                "SOLANA_PRIVATE_KEY not set; automatic dispatch will fail until batches are completed manually"
            );
            Arc::new(UnconfiguredSigner)
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
