mod clicks;
mod config;
mod error;
mod handlers;
mod middleware;
mod models;
mod repos;
mod state;
mod stores;
#[cfg(test)]
mod test_utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{Router, http};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    clicks::FlushWorker,
    config::{Config, StoreBackend},
    repos::{PgUserRepo, Repos},
    state::AppState,
    stores::{MemoryExistenceCache, SlidingWindowRateLimiter, Stores},
};

/// Durable rows loaded into an empty ranking at startup.
const RANKING_SEED_LIMIT: i64 = 10_000;

#[derive(Parser)]
#[command(name = "api")]
#[command(about = "Click counter API server")]
struct Args {
    /// Run database migrations and exit
    #[arg(long)]
    migrate: bool,

    /// Rebuild the ranking from the durable store and exit
    #[arg(long)]
    seed_ranking: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    let config = envy::prefixed("CLICKER_").from_env::<Config>()?;

    // Initialize Sentry for error tracking (must be done early, guard must stay alive)
    let _sentry_guard = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: Some(config.env.clone().into()),
                ..Default::default()
            },
        ))
    });

    // Set up tracing: JSON in production, human-readable otherwise
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.is_production() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }

    config.validate()?;

    if config.is_production() && config.bot_token.is_none() {
        anyhow::bail!("CLICKER_BOT_TOKEN must be set in production");
    }

    let database = PgPoolOptions::new()
        .max_connections(25)
        .connect(&config.database_url)
        .await?;

    // Run migrations via init container only (--migrate flag)
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&database).await?;
        tracing::info!("Migrations complete");
        return Ok(());
    }

    let repos = Repos {
        users: Arc::new(PgUserRepo::new(database.clone())),
    };

    let stores = match config.store_backend {
        StoreBackend::Redis => {
            let redis = redis::Client::open(config.redis_url.as_str())?;
            Stores::redis(redis, config.existence_ttl())
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-process stores; limits and buffers are per process");
            let limiter = Arc::new(SlidingWindowRateLimiter::new());
            let existence = Arc::new(MemoryExistenceCache::new(config.existence_ttl()));
            spawn_memory_cleanup(limiter.clone(), existence.clone(), &config);
            Stores {
                rate_limiter: limiter,
                existence,
                ..Stores::memory(config.existence_ttl())
            }
        }
    };

    let state = AppState::new(config.clone(), repos, stores);

    if args.seed_ranking {
        let seeded = state.clicks.seed_ranking(RANKING_SEED_LIMIT).await?;
        tracing::info!(seeded, "Ranking rebuilt");
        return Ok(());
    }

    match state.clicks.seed_ranking_if_empty(RANKING_SEED_LIMIT).await {
        Ok(0) => {}
        Ok(seeded) => tracing::info!(seeded, "Seeded empty ranking from durable store"),
        Err(err) => tracing::warn!(error = ?err, "Failed to seed ranking; totals reseed on read"),
    }

    let flush_worker = FlushWorker::start(
        state.buffer.clone(),
        config.flush_interval(),
        config.flush_drain_retries,
    );
    // Replay whatever a previous process left in the buffer before the first tick
    flush_worker.flush_now();

    // Request ID header name
    let x_request_id = http::HeaderName::from_static("x-request-id");

    let api = Router::new()
        .merge(handlers::auth::router())
        .merge(handlers::clicks::router())
        .merge(handlers::users::router())
        .merge(handlers::leaderboard::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::global_admission,
        ));

    let app = Router::new()
        .nest("/health", handlers::health::router())
        .nest("/api", api)
        .with_state(state)
        // Request ID: generate UUID, include in logs, return in response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &http::Request<axum::body::Body>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            },
        ))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(RequestBodyLimitLayer::new(16 * 1024)); // 16KB limit

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Timer first, then drain what is still buffered, then release connections
    tracing::info!("Draining write buffer...");
    flush_worker.stop().await;
    database.close().await;

    tracing::info!("Shutdown complete");

    Ok(())
}

/// Periodically drop idle limiter scopes and expired existence flags.
fn spawn_memory_cleanup(
    limiter: Arc<SlidingWindowRateLimiter>,
    existence: Arc<MemoryExistenceCache>,
    config: &Config,
) {
    let window = config.click_rate_window().max(config.global_rate_window());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(window.max(Duration::from_secs(60)));
        loop {
            interval.tick().await;
            limiter.cleanup(window);
            let evicted = existence.cleanup();
            if evicted > 0 {
                tracing::debug!(evicted, "expired existence flags evicted");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
