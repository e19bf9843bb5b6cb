// API gateway: shared application state and the handler modules.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::cache::{ResponseCache, SingleFlight};
use crate::config::Config;
use crate::middleware::dedup::{BufferedResponse, DEDUP_LINGER};
use crate::queue::JobQueue;
use crate::storage::ArtifactStore;

pub mod analytics;
pub mod health;
pub mod routes;
pub mod scans;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: ConnectionManager,
    pub scan_queue: Arc<JobQueue>,
    pub analysis_queue: Arc<JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub response_cache: Arc<ResponseCache>,
    /// In-flight request dedup, keyed `method:url:ip`.
    pub inflight: Arc<SingleFlight<BufferedResponse>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        redis: ConnectionManager,
        scan_queue: Arc<JobQueue>,
        analysis_queue: Arc<JobQueue>,
        artifacts: Arc<dyn ArtifactStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            redis,
            scan_queue,
            analysis_queue,
            artifacts,
            response_cache: Arc::new(ResponseCache::new()),
            inflight: Arc::new(SingleFlight::new(DEDUP_LINGER)),
            config,
        }
    }
}
