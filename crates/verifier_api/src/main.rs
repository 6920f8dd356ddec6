//! Batch Email Verification API Server
//!
//! Accepts a JSON array of addresses over HTTP and answers with a verdict
//! per distinct address, obtained by syntax checks, MX resolution, and an
//! SMTP probe of each mail exchanger. Built with axum and tokio.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verifier_core::{
    spawn_flush_timer, AddressValidator, BatchEngine, HickoryMxResolver, MxCache, NetworkProber,
    VerdictCache,
};

mod config;
mod routes;

use config::{load_config, AppConfig};
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    init_tracing(&config);

    info!(
        "Starting batch email verification API v{}",
        env!("CARGO_PKG_VERSION")
    );

    let engine_config = config.engine_config();

    let result_cache = engine_config.result_cache.enabled.then(|| {
        Arc::new(VerdictCache::new(
            "verdicts",
            engine_config.result_cache.max_size,
        ))
    });
    let mx_cache = engine_config
        .mx_cache
        .enabled
        .then(|| Arc::new(MxCache::new("mx", engine_config.mx_cache.max_size)));

    // flush timers hold weak references; the handles are kept so shutdown
    // can stop them explicitly
    let mut flush_timers = Vec::new();
    if let Some(cache) = &result_cache {
        flush_timers.extend(spawn_flush_timer(cache, engine_config.result_cache.gc_period()));
    }
    if let Some(cache) = &mx_cache {
        flush_timers.extend(spawn_flush_timer(cache, engine_config.mx_cache.gc_period()));
    }

    let resolver = Arc::new(
        HickoryMxResolver::from_system_conf()
            .context("initializing DNS resolver from system configuration")?,
    );
    let prober = Arc::new(NetworkProber::new(
        engine_config.connect_timeout(),
        engine_config.danger_accept_invalid_certs,
    ));

    let validator = AddressValidator::new(
        &engine_config,
        resolver,
        prober,
        result_cache.clone(),
        mx_cache.clone(),
    );
    let engine = BatchEngine::new(Arc::new(validator), &engine_config);

    let state = Arc::new(AppState {
        engine,
        password: config.password.clone(),
        result_cache,
        mx_cache,
    });

    let app = build_app(state);

    // an empty ip binds every interface
    let ip = if config.ip.is_empty() {
        "0.0.0.0"
    } else {
        config.ip.as_str()
    };
    let addr: SocketAddr = format!("{}:{}", ip, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", ip, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for timer in flush_timers {
        timer.abort();
    }

    info!("Server shut down gracefully");
    Ok(())
}

/// Attach middleware to the application routes.
fn build_app(state: Arc<AppState>) -> Router {
    routes::build_routes(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Initialize tracing and logging
fn init_tracing(config: &AppConfig) {
    let level = if config.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("{}={level},verifier_core={level}", env!("CARGO_PKG_NAME")).into()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
