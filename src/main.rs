use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    http::{HeaderName, Request, StatusCode},
    routing::{get, patch, post},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::{
    request_id::{MakeRequestId, RequestId, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use shortly::{
    analytics::{self, Aggregator, VisitSink},
    cache::LinkCache,
    config::AppConfig,
    db,
    geo::GeoService,
    handlers, AppState,
};

// ── Request IDs ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(id.parse().ok()?))
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (ignore error if file is absent — env vars may already be set)
    dotenvy::dotenv().ok();

    // Initialise structured logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shortly=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env()?;
    tracing::info!("Starting Shortly on {}:{}", config.host, config.port);
    tracing::info!("Base URL: {}", config.base_url);

    // Open SQLite connection pool
    // CREATE the file if it doesn't exist yet
    let db = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(
            config
                .database_url
                .parse::<sqlx::sqlite::SqliteConnectOptions>()?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true),
        )
        .await?;

    // Run embedded migrations (files in migrations/)
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations applied");

    // Warm the redirect cache
    let cache = LinkCache::new();
    db::warm_cache(&db, &cache).await?;

    // Rebuild analytics aggregates by replaying the persisted visit log,
    // then hand the aggregator to its worker task.
    let aggregator = Arc::new(Aggregator::new(config.analytics.clone()));
    let visits = db::all_visits(&db).await?;
    aggregator.replay(&visits);

    let geo = if config.geo_lookup_enabled {
        Some(GeoService::new()?)
    } else {
        None
    };
    let sink: Arc<dyn VisitSink> = Arc::new(db::SqliteVisitSink::new(db.clone()));
    let worker = tokio::spawn(analytics::run_worker(aggregator.clone(), sink, geo));

    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let bind_addr = format!("{}:{}", config.host, config.port);

    let state = Arc::new(AppState {
        db,
        config,
        cache,
        analytics: aggregator,
    });

    // ── Router ─────────────────────────────────────────────────────────────
    let app = Router::new()
        // Root redirect
        .route("/", get(handlers::links::index))
        // Health check — returns 200 OK with no auth required
        .route("/health", get(|| async { StatusCode::OK }))
        // Link management API. Static segments take priority over the
        // :code capture below.
        .route(
            "/links",
            post(handlers::links::create_link).get(handlers::links::list_links),
        )
        .route(
            "/links/:code",
            patch(handlers::links::update_link).delete(handlers::links::delete_link),
        )
        .route("/links/:code/analytics", get(handlers::links::link_analytics))
        // Short-link redirect — the catch-all, so it comes last
        .route("/:code", get(handlers::redirect::redirect))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ));

    // ── Serve ──────────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Let the worker drain and persist whatever is still buffered.
    state.analytics.begin_shutdown();
    if let Err(e) = worker.await {
        tracing::warn!("analytics worker did not stop cleanly: {e}");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM so deployments can stop the service cleanly.
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

    tracing::info!("Shutdown signal received");
}
