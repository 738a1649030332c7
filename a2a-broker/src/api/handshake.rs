use std::sync::Arc;

use tracing::info;
use warp::{Rejection, Reply};

use crate::models::HandshakeRequest;
use crate::protocol::ProtocolServer;

pub async fn handle_handshake(
    request: HandshakeRequest,
    server: Arc<ProtocolServer>,
) -> Result<impl Reply, Rejection> {
    let response = server.handshake(request).await?;
    info!(agent_id = %response.agent_id, "Agent handshake completed");
    Ok(warp::reply::json(&response))
}
