use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use warp::{Rejection, Reply};

use crate::error::ApiError;
use crate::models::{HeartbeatRequest, MessageRequest};
use crate::protocol::ProtocolServer;

pub async fn handle_message(
    request: MessageRequest,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    server.submit_message(request).await?;
    Ok(warp::reply::json(&json!({"status": "success"})))
}

pub async fn handle_heartbeat(
    request: HeartbeatRequest,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    let agent_id = request
        .agent_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            warp::reject::custom(ApiError::BadRequest(
                "missing required field: agent_id".to_string(),
            ))
        })?;

    let known = server.heartbeat(agent_id).await;
    if !known {
        debug!(agent_id, "Heartbeat from unknown agent ignored");
    }
    Ok(warp::reply::json(&json!({"status": "success", "known": known})))
}
