use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::{header, Method},
    middleware,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use websurface_api::api::{routes, AppState};
use websurface_api::config::Config;
use websurface_api::db;
use websurface_api::middleware::request_id_middleware;
use websurface_api::queue::{
    JobQueue, QueueSettings, RedisQueueStore, ANALYSIS_QUEUE, SCAN_QUEUE,
};
use websurface_api::storage::{ArtifactStore, LocalArtifactStore};
use websurface_api::vuln::{OsvClient, VulnService};
use websurface_api::worker::WorkerRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "websurface_api=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);

    // Database connection + migrations
    let pool = db::init_pool(&config).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations completed");

    // Queue backend (single shared connection per process)
    let redis_client = redis::Client::open(config.effective_redis_url())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Connected to Redis");

    let queue_store: Arc<dyn websurface_api::queue::QueueStore> =
        Arc::new(RedisQueueStore::new(redis_conn.clone()));
    let scan_queue = Arc::new(JobQueue::new(
        SCAN_QUEUE,
        Arc::clone(&queue_store),
        QueueSettings::default(),
    ));
    let analysis_queue = Arc::new(JobQueue::new(
        ANALYSIS_QUEUE,
        Arc::clone(&queue_store),
        QueueSettings::default(),
    ));

    // Artifact store
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(config.artifacts_dir.clone()));

    // Advisory feed client with DB-backed cache
    let osv_client = OsvClient::new(config.osv_api_url.clone(), config.osv_timeout())?;
    let vuln_service = Arc::new(VulnService::new(osv_client, config.vuln_cache_ttl));

    // Worker pools
    let workers = WorkerRuntime::spawn(
        pool.clone(),
        Arc::clone(&scan_queue),
        Arc::clone(&analysis_queue),
        Arc::clone(&artifacts),
        vuln_service,
        Arc::clone(&config),
    )?;

    // Application state
    let state = AppState::new(
        pool,
        redis_conn,
        scan_queue,
        analysis_queue,
        artifacts,
        Arc::clone(&config),
    );

    // CORS: comma-separated origin list, or "*" for any origin.
    let cors = if config.cors_origin.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
    } else {
        let origins: Vec<header::HeaderValue> = config
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
    };
    tracing::info!("CORS configured for origins: {}", config.cors_origin);

    // Build router
    let app = Router::new()
        .merge(routes::operational_routes())
        .nest("/api", routes::api_routes(state.clone()))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(RequestBodyLimitLayer::new(config.max_request_size_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.port).parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop accepting work, drain active jobs, then exit.
    workers.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
