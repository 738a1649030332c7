use std::sync::Arc;

use tracing::error;
use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::protocol::ProtocolServer;

pub async fn handle_health(server: Arc<ProtocolServer>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&server.health()))
}

pub async fn handle_dead_letters(server: Arc<ProtocolServer>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&server.dead_letters().await))
}

pub async fn handle_metrics_json(server: Arc<ProtocolServer>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&server.metrics().await))
}

/// Prometheus text exposition of the broker's private registry.
pub async fn handle_metrics_text(server: Arc<ProtocolServer>) -> Result<impl Reply, Rejection> {
    let body = server.metrics_text().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        warp::reject::custom(ApiError::InternalError(e.to_string()))
    })?;
    Ok(warp::reply::with_header(
        body,
        "Content-Type",
        prometheus::TEXT_FORMAT,
    ))
}
