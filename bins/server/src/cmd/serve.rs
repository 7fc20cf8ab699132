use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cluster_memory::MemoryCluster;
use lens_api::LogCluster;
use topic_api_server::AppState;

use crate::config::{Backend, ServeArgs, ServerConfig};
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("topic-lens starting");

    // --- Load config ---
    let config = ServerConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.config {
        tracing::info!(config = %path.display(), "loaded config");
    }

    // --- Connect: failure here is fatal ---
    let cluster = connect(&args, &config).await?;

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    let state = AppState::new(cluster.clone(), &config.engine, token.clone());
    let poll = state.poll.clone();

    let bind = args.bind_addr();
    let mut api = tokio::spawn({
        let token = token.clone();
        async move { topic_api_server::run(&bind, state, token).await }
    });

    // --- Wait for ctrl-c or an early gateway exit ---
    let early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "listening for ctrl-c failed, shutting down"),
            }
            None
        }
        joined = &mut api => Some(joined),
    };

    token.cancel();
    let served = match early {
        Some(joined) => joined,
        None => api.await,
    };

    poll.stop().await;
    if let Err(e) = cluster.close().await {
        tracing::warn!(error = %e, "closing cluster connection failed");
    }
    tracing::info!("topic-lens stopped");

    served?.map_err(ServerError::Gateway)
}

async fn connect(args: &ServeArgs, config: &ServerConfig) -> Result<Arc<dyn LogCluster>, ServerError> {
    match args.backend {
        Backend::Memory => {
            tracing::info!("using in-memory cluster");
            Ok(Arc::new(MemoryCluster::new(config.memory.clone())))
        }
        Backend::Kafka => connect_kafka(args, config).await,
    }
}

#[cfg(feature = "kafka")]
async fn connect_kafka(args: &ServeArgs, config: &ServerConfig) -> Result<Arc<dyn LogCluster>, ServerError> {
    let brokers = args.brokers();
    let cluster = cluster_kafka::KafkaCluster::connect(&brokers, config.kafka.clone())
        .await
        .map_err(|e| e.with_context(format!("connect {brokers}")))?;
    tracing::info!(brokers = %brokers, "connected to kafka");
    Ok(Arc::new(cluster))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka(_args: &ServeArgs, _config: &ServerConfig) -> Result<Arc<dyn LogCluster>, ServerError> {
    Err(ServerError::BackendUnavailable("kafka"))
}
