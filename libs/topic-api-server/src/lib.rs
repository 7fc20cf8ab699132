//! HTTP + WebSocket gateway over the topic engine.

mod error;
mod http;
mod range;
mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use lens_api::LogCluster;
use topic_engine::{EngineConfig, MetadataAccessor, PollSupervisor, RangeConfig, SearchCoordinator};

pub use error::ApiError;
pub use range::{parse_offset_range, parse_partition};

/// Shared handler state. Cloned per request; everything inside is a handle.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<dyn LogCluster>,
    pub metadata: MetadataAccessor,
    pub search: Arc<SearchCoordinator>,
    pub poll: PollSupervisor,
    pub range: RangeConfig,
    /// Fired on gateway shutdown; ends open searches and poll sockets.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the engine components around one cluster connection.
    /// Spawns the poll supervisor, so it must run inside a runtime.
    pub fn new(cluster: Arc<dyn LogCluster>, config: &EngineConfig, shutdown: CancellationToken) -> Self {
        let metadata = MetadataAccessor::new(cluster.clone());
        Self {
            search: Arc::new(SearchCoordinator::new(cluster.clone(), config.search.clone())),
            poll: PollSupervisor::spawn(metadata.clone(), config.poll.clone()),
            metadata,
            cluster,
            range: config.range.clone(),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/topics", get(http::handle_metadata))
        .route("/topics/{topic}", axum::routing::post(http::handle_publish))
        .route("/topics/{topic}/poll", get(ws::handle_poll))
        .route("/topics/{topic}/{keyword}", get(http::handle_search))
        .route("/topics/{topic}/{partition}/{range}", get(http::handle_range))
        .with_state(state)
}

/// Serve the gateway on `bind` until `shutdown` fires.
pub async fn run(bind: &str, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve(listener, state, shutdown).await
}

/// Serve the gateway on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("gateway stopped");
    Ok(())
}
