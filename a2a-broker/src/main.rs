use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use warp::Filter;

mod agents;
mod api;
mod broker;
mod config;
mod error;
mod middleware;
mod models;
mod protocol;
mod redis_client;
mod shutdown;
mod store;
#[cfg(test)]
mod testing;
mod transport;

use crate::protocol::ProtocolServer;
use crate::store::KvStore;
use crate::transport::{HttpTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(server_name = %config.server_name, "Starting A2A broker");

    let store: Option<Arc<dyn KvStore>> = if config.enable_persistence {
        let store: Arc<dyn KvStore> = match redis_client::RedisStore::new(&config.redis_url).await {
            Ok(store) => {
                info!("Redis connection established");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, keeping messages in memory only");
                Arc::new(store::MemoryStore::new())
            }
        };
        Some(store)
    } else {
        info!("Persistence disabled");
        None
    };

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(Duration::from_secs(
        config.message_timeout_secs,
    ))?);

    let server = ProtocolServer::start(config.server_settings(), store, Some(transport)).await?;

    let routes = api::routes(server.clone())
        .recover(error::handle_rejection)
        .with(warp::log("a2a"))
        .with(middleware::cors());

    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (bound, serving) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    })?;
    info!(address = %bound, "Server listening");

    serving.await;
    server.shutdown().await;
    Ok(())
}
